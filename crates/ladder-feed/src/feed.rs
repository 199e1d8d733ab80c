//! Canonical price feed for one symbol.
//!
//! Subscribes through the connection manager, normalizes ticker
//! payloads, throttles unchanged prices, and falls back to REST polling
//! when the stream goes stale. Observers register through a broadcast
//! channel; the latest observation is also readable synchronously via
//! `SharedPrice`.

use crate::error::FeedError;
use crate::normalize::Normalizer;
use crate::shared::SharedPrice;
use ladder_core::{Price, PriceSource, PriceUpdate};
use ladder_exchange::{QuoteSource, RetryExecutor};
use ladder_ws::{ConnectionManager, ConnectionState, StreamEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Price feed configuration.
#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    /// Trading symbol.
    pub symbol: String,
    /// Minimum interval between deliveries of an unchanged price.
    pub min_publish_interval_ms: u64,
    /// Stream age past which a REST fetch is triggered.
    pub stale_fetch_threshold_ms: i64,
    /// Stream age past which the connection is also forced to reconnect.
    pub stale_reconnect_threshold_ms: i64,
    /// How often staleness is evaluated.
    pub staleness_check_interval_ms: u64,
    /// Attempts per REST fetch (through the retry executor).
    pub rest_attempts: u32,
    /// Base backoff after consecutive REST fetch failures.
    pub rest_failure_backoff_base_ms: u64,
    /// Cap on the REST failure backoff.
    pub rest_failure_backoff_max_ms: u64,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            min_publish_interval_ms: 250,
            stale_fetch_threshold_ms: 5000,
            stale_reconnect_threshold_ms: 20000,
            staleness_check_interval_ms: 1000,
            rest_attempts: 3,
            rest_failure_backoff_base_ms: 2000,
            rest_failure_backoff_max_ms: 30000,
        }
    }
}

/// Unresolvable payloads are logged once per this many occurrences.
const UNRESOLVED_LOG_SAMPLE: u64 = 100;

/// Decision of the periodic staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StalenessAction {
    None,
    /// Soft threshold crossed: refresh over REST, stream left alone.
    RestFetch,
    /// Hard threshold crossed: refresh over REST and force a reconnect.
    RestFetchAndReconnect,
}

fn staleness_action(age_ms: i64, soft_ms: i64, hard_ms: i64) -> StalenessAction {
    if age_ms >= hard_ms {
        StalenessAction::RestFetchAndReconnect
    } else if age_ms >= soft_ms {
        StalenessAction::RestFetch
    } else {
        StalenessAction::None
    }
}

/// Suppresses repeat delivery of an unchanged price within a minimum
/// interval. The first update after a cold start or reconnect always
/// passes so nothing blocks on "first price".
struct ThrottleGate {
    min_interval: Duration,
    last: Option<(Price, Instant)>,
    pass_next: bool,
}

impl ThrottleGate {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
            pass_next: true,
        }
    }

    fn allow(&mut self, price: Price, now: Instant) -> bool {
        if self.pass_next {
            self.pass_next = false;
            self.last = Some((price, now));
            return true;
        }

        if let Some((last_price, delivered_at)) = self.last {
            if last_price == price && now.duration_since(delivered_at) < self.min_interval {
                return false;
            }
        }

        self.last = Some((price, now));
        true
    }

    /// Let the next update through unconditionally (reconnect).
    fn force_next(&mut self) {
        self.pass_next = true;
    }
}

/// Cloneable control handle for a running feed.
#[derive(Clone)]
pub struct PriceFeedHandle {
    shared: SharedPrice,
    update_tx: broadcast::Sender<PriceUpdate>,
    shutdown: CancellationToken,
}

impl PriceFeedHandle {
    /// Register a price-update observer.
    pub fn subscribe(&self) -> broadcast::Receiver<PriceUpdate> {
        self.update_tx.subscribe()
    }

    /// Synchronous read handle over the latest observation.
    pub fn shared(&self) -> SharedPrice {
        self.shared.clone()
    }

    /// Stop the feed loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Canonical price feed for one symbol.
pub struct PriceFeed<Q: QuoteSource> {
    config: PriceFeedConfig,
    connection: Arc<ConnectionManager>,
    primary: Q,
    fallback: Option<Q>,
    normalizer: Normalizer,
    shared: SharedPrice,
    update_tx: broadcast::Sender<PriceUpdate>,
    retry: RetryExecutor,
    throttle: ThrottleGate,
    unresolved: AtomicU64,
    rest_failures: u32,
    next_rest_allowed: Option<Instant>,
    last_forced_reconnect: Option<Instant>,
    last_stream_at: Instant,
    shutdown: CancellationToken,
}

impl<Q: QuoteSource> PriceFeed<Q> {
    pub fn new(
        config: PriceFeedConfig,
        connection: Arc<ConnectionManager>,
        primary: Q,
        fallback: Option<Q>,
    ) -> Self {
        let (update_tx, _) = broadcast::channel(256);
        Self {
            normalizer: Normalizer::new(config.symbol.clone()),
            throttle: ThrottleGate::new(Duration::from_millis(config.min_publish_interval_ms)),
            config,
            connection,
            primary,
            fallback,
            shared: SharedPrice::new(),
            update_tx,
            retry: RetryExecutor::default(),
            unresolved: AtomicU64::new(0),
            rest_failures: 0,
            next_rest_allowed: None,
            last_forced_reconnect: None,
            last_stream_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Control handle; take before moving the feed into its task.
    pub fn handle(&self) -> PriceFeedHandle {
        PriceFeedHandle {
            shared: self.shared.clone(),
            update_tx: self.update_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run the feed loop until shutdown.
    pub async fn run(mut self, mut events: mpsc::Receiver<StreamEvent>) {
        info!(symbol = %self.config.symbol, "Price feed started");

        let mut state_rx = self.connection.watch_state();
        let mut check = tokio::time::interval(Duration::from_millis(
            self.config.staleness_check_interval_ms,
        ));
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The staleness clock starts at feed startup, not at the epoch.
        self.last_stream_at = Instant::now();
        let mut events_closed = false;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!(symbol = %self.config.symbol, "Price feed stopped");
                    return;
                }

                event = events.recv(), if !events_closed => {
                    match event {
                        Some(event) => self.on_stream_event(&event),
                        None => {
                            warn!("Stream event channel closed, REST fallback only");
                            events_closed = true;
                        }
                    }
                }

                changed = state_rx.changed() => {
                    if changed.is_ok() && *state_rx.borrow_and_update() == ConnectionState::Open {
                        // Unblock anything waiting on first price after reconnect.
                        self.throttle.force_next();
                    }
                }

                _ = check.tick() => {
                    self.on_staleness_check().await;
                }
            }
        }
    }

    fn on_stream_event(&mut self, event: &StreamEvent) {
        match self.normalizer.normalize(&event.payload) {
            Ok(tick) => {
                self.last_stream_at = Instant::now();
                self.publish(tick.price, PriceSource::Stream);
            }
            Err(e) => self.log_unresolved(&e),
        }
    }

    /// Sampled logging for unresolvable payloads.
    fn log_unresolved(&self, error: &FeedError) {
        let count = self.unresolved.fetch_add(1, Ordering::Relaxed) + 1;
        if count % UNRESOLVED_LOG_SAMPLE == 1 {
            warn!(total = count, error = %error, "Dropping unresolvable payload");
        }
    }

    fn publish(&mut self, price: Price, source: PriceSource) {
        if !price.is_positive() {
            warn!(%price, %source, "Dropping non-positive price");
            return;
        }

        if !self.throttle.allow(price, Instant::now()) {
            trace!(%price, "Unchanged price throttled");
            return;
        }

        let update = PriceUpdate::new(self.config.symbol.clone(), price, source);
        self.shared.set(update.clone());
        // No receivers is fine; SharedPrice still carries the update.
        let _ = self.update_tx.send(update);
    }

    async fn on_staleness_check(&mut self) {
        let age_ms = self.last_stream_at.elapsed().as_millis() as i64;
        let action = staleness_action(
            age_ms,
            self.config.stale_fetch_threshold_ms,
            self.config.stale_reconnect_threshold_ms,
        );

        match action {
            StalenessAction::None => {}
            StalenessAction::RestFetch => {
                debug!(age_ms, "Stream stale, refreshing over REST");
                self.rest_refresh().await;
            }
            StalenessAction::RestFetchAndReconnect => {
                self.maybe_force_reconnect(age_ms);
                self.rest_refresh().await;
            }
        }
    }

    /// Force at most one reconnect per hard-staleness window.
    fn maybe_force_reconnect(&mut self, age_ms: i64) {
        let window = Duration::from_millis(self.config.stale_reconnect_threshold_ms as u64);
        let recently_forced = self
            .last_forced_reconnect
            .is_some_and(|t| t.elapsed() < window);
        if recently_forced {
            return;
        }

        if self.connection.is_failed() {
            // Degraded status: the manager exhausted its reconnect
            // attempts; REST polling is all that remains until an
            // explicit reset.
            warn!(age_ms, "Connection manager failed, continuing on REST fallback");
            self.last_forced_reconnect = Some(Instant::now());
            return;
        }

        warn!(age_ms, "Stream hard-stale, forcing reconnect");
        self.connection.force_reconnect();
        self.last_forced_reconnect = Some(Instant::now());
    }

    async fn rest_refresh(&mut self) {
        if let Some(allowed_at) = self.next_rest_allowed {
            if Instant::now() < allowed_at {
                trace!("REST fetch suppressed by failure backoff");
                return;
            }
        }

        match self.fetch_over_rest().await {
            Some((price, source)) => {
                self.rest_failures = 0;
                self.next_rest_allowed = None;
                self.publish(price, source);
            }
            None => {
                self.rest_failures += 1;
                let backoff = rest_failure_backoff(
                    self.rest_failures,
                    self.config.rest_failure_backoff_base_ms,
                    self.config.rest_failure_backoff_max_ms,
                );
                self.next_rest_allowed = Some(Instant::now() + backoff);
                warn!(
                    failures = self.rest_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "REST refresh failed, backing off"
                );

                // Last resort: re-surface the cached price so consumers
                // can at least tell how old their data is.
                if let Some(last) = self.shared.latest() {
                    self.publish(last.price, PriceSource::Cache);
                }
            }
        }
    }

    async fn fetch_over_rest(&self) -> Option<(Price, PriceSource)> {
        let symbol = self.config.symbol.clone();
        let attempts = self.config.rest_attempts;

        let primary = self
            .retry
            .execute(|| self.primary.fetch_quote(&symbol), attempts)
            .await;
        match primary {
            Ok(price) => return Some((price, PriceSource::RestPrimary)),
            Err(e) => warn!(error = %e, "Primary REST price source failed"),
        }

        let fallback = self.fallback.as_ref()?;
        let secondary = self
            .retry
            .execute(|| fallback.fetch_quote(&symbol), attempts)
            .await;
        match secondary {
            Ok(price) => Some((price, PriceSource::RestFallback)),
            Err(e) => {
                warn!(error = %e, "Fallback REST price source failed");
                None
            }
        }
    }
}

fn rest_failure_backoff(failures: u32, base_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64 << failures.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}
