//! Market-data connection manager.
//!
//! Owns at most one live connection to the streaming endpoint and one
//! logical subscription, surviving transport failures transparently.
//! Every connect attempt gets a strictly increasing id; events captured
//! by a superseded connection compare their id against the current one
//! and are dropped without side effects.

use crate::dedup::DedupCache;
use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::{is_subscription_ack, EventIdentity, StreamEvent, WsRequest};
use crate::subscription::SubscriptionTracker;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Stream name for the single logical subscription (e.g., "btcusdt@ticker").
    pub stream: String,
    /// Maximum consecutive reconnection attempts before the manager fails.
    pub max_reconnect_attempts: u32,
    /// Base delay for reconnection backoff.
    pub reconnect_base_delay_ms: u64,
    /// Backoff growth factor per attempt.
    pub reconnect_backoff_factor: f64,
    /// Cap on the reconnection delay.
    pub reconnect_max_delay_ms: u64,
    /// Keepalive ping interval.
    pub heartbeat_interval_ms: u64,
    /// How long a keepalive ack may lag its ping.
    pub heartbeat_timeout_ms: u64,
    /// Consecutive missed acks before a forced reconnect.
    pub max_heartbeat_failures: u32,
    /// Duplicate-suppression cache settings.
    pub dedup: crate::dedup::DedupConfig,
    /// Dedup cache sweep interval.
    pub dedup_sweep_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            stream: String::new(),
            max_reconnect_attempts: 8,
            reconnect_base_delay_ms: 1000,
            reconnect_backoff_factor: 1.5,
            reconnect_max_delay_ms: 30000,
            heartbeat_interval_ms: 15000,
            heartbeat_timeout_ms: 5000,
            max_heartbeat_failures: 3,
            dedup: crate::dedup::DedupConfig::default(),
            dedup_sweep_interval_ms: 30000,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
    ReconnectWait,
    /// Reconnect attempts exhausted; no further connects until `reset()`.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::ReconnectWait => write!(f, "RECONNECT_WAIT"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Market-data connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    /// Monotonic connect-attempt counter.
    conn_seq: AtomicU64,
    /// Id of the connection currently allowed to produce events.
    current_id: AtomicU64,
    /// At most one connect operation may be outstanding.
    connect_in_progress: AtomicBool,
    /// Coalesces connect requests arriving while a close drains.
    pending_connect: AtomicBool,
    /// Consecutive failed attempts since the last successful open.
    attempts: AtomicU32,
    /// Subscribe request id sequence.
    request_seq: AtomicU64,
    heartbeat: HeartbeatMonitor,
    dedup: DedupCache,
    subscription: SubscriptionTracker,
    event_tx: mpsc::Sender<StreamEvent>,
    reconnect_notify: Notify,
    shutdown_token: CancellationToken,
    last_opened_at: RwLock<Option<DateTime<Utc>>>,
    last_closed_at: RwLock<Option<DateTime<Utc>>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new(config: ConnectionConfig, event_tx: mpsc::Sender<StreamEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            heartbeat: HeartbeatMonitor::new(
                config.heartbeat_interval_ms,
                config.heartbeat_timeout_ms,
                config.max_heartbeat_failures,
            ),
            dedup: DedupCache::new(config.dedup.clone()),
            subscription: SubscriptionTracker::new(config.stream.clone()),
            config,
            state_tx,
            conn_seq: AtomicU64::new(0),
            current_id: AtomicU64::new(0),
            connect_in_progress: AtomicBool::new(false),
            pending_connect: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            request_seq: AtomicU64::new(0),
            event_tx,
            reconnect_notify: Notify::new(),
            shutdown_token: CancellationToken::new(),
            last_opened_at: RwLock::new(None),
            last_closed_at: RwLock::new(None),
        }
    }

    /// Get current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Check whether the manager gave up reconnecting.
    pub fn is_failed(&self) -> bool {
        self.state() == ConnectionState::Failed
    }

    /// Check whether the logical subscription is confirmed active.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_subscribed()
    }

    /// Id of the connection currently allowed to produce events.
    pub fn current_connection_id(&self) -> u64 {
        self.current_id.load(Ordering::SeqCst)
    }

    /// When the current connection opened, if any.
    pub fn last_opened_at(&self) -> Option<DateTime<Utc>> {
        *self.last_opened_at.read()
    }

    /// When the previous connection closed, if any.
    pub fn last_closed_at(&self) -> Option<DateTime<Utc>> {
        *self.last_closed_at.read()
    }

    /// Signal graceful shutdown; the run loop exits promptly.
    pub fn shutdown(&self) {
        info!("ConnectionManager shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Force a full reconnect of the live connection.
    ///
    /// Supersedes the current connection id first so that frames still
    /// in flight from the old transport are dropped, then wakes the
    /// run loop to tear it down and dial again.
    pub fn force_reconnect(&self) {
        let superseded = self.current_id.fetch_add(1, Ordering::SeqCst);
        warn!(superseded_id = superseded, "Forced reconnect requested");
        self.reconnect_notify.notify_waiters();
    }

    /// Clear the failed state and re-arm the manager.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.heartbeat.reset();
        self.dedup.clear();
        self.set_state(ConnectionState::Closed);
        info!("Connection manager reset");
    }

    /// Connect and run until shutdown or reconnect exhaustion.
    ///
    /// A second call while one is outstanding is coalesced into a single
    /// pending request that runs once the first drains.
    pub async fn run(&self) -> WsResult<()> {
        if self.connect_in_progress.swap(true, Ordering::SeqCst) {
            self.pending_connect.store(true, Ordering::SeqCst);
            debug!("Connect requested while one is in progress, coalesced");
            return Ok(());
        }

        loop {
            let result = self.run_with_retry().await;
            self.connect_in_progress.store(false, Ordering::SeqCst);

            let rerun = self.pending_connect.swap(false, Ordering::SeqCst)
                && !self.is_shutdown()
                && !self.is_failed();
            if !rerun {
                return result;
            }
            self.connect_in_progress.store(true, Ordering::SeqCst);
        }
    }

    async fn run_with_retry(&self) -> WsResult<()> {
        loop {
            if self.is_shutdown() {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let conn_id = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.current_id.store(conn_id, Ordering::SeqCst);

            match self.run_connection(conn_id).await {
                Ok(()) => {
                    info!(conn_id, "Connection closed");
                }
                Err(WsError::ReconnectRequested) => {
                    warn!(conn_id, "Connection torn down for forced reconnect");
                }
                Err(e) => {
                    error!(conn_id, error = %e, "Connection error");
                }
            }

            *self.last_closed_at.write() = Some(Utc::now());
            // Subscription does not survive the transport; the intent does.
            self.subscription.reset();

            if self.is_shutdown() {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.config.max_reconnect_attempts {
                error!(attempt, "Reconnect attempts exhausted, manager failed");
                self.set_state(ConnectionState::Failed);
                return Err(WsError::ReconnectExhausted { attempts: attempt });
            }

            self.set_state(ConnectionState::ReconnectWait);
            let delay = self.backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
            }
        }
    }

    async fn run_connection(&self, conn_id: u64) -> WsResult<()> {
        info!(url = %self.config.url, conn_id, "Connecting to market-data stream");

        let (ws_stream, _response) =
            connect_async_tls_with_config(&self.config.url, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        if self.current_id.load(Ordering::SeqCst) != conn_id {
            // Superseded while the handshake was in flight.
            debug!(conn_id, "Connection superseded before open, discarding");
            let _ = write.send(Message::Close(None)).await;
            return Err(WsError::ReconnectRequested);
        }

        self.set_state(ConnectionState::Open);
        self.attempts.store(0, Ordering::SeqCst);
        *self.last_opened_at.write() = Some(Utc::now());
        self.heartbeat.reset();
        info!(conn_id, "Market-data stream connected");

        // Always re-issue the subscription: it never survives a reconnect.
        let req = WsRequest::subscribe(
            self.subscription.stream(),
            self.request_seq.fetch_add(1, Ordering::SeqCst) + 1,
        );
        write.send(Message::Text(serde_json::to_string(&req)?)).await?;
        self.subscription.mark_pending();

        let mut sweep =
            tokio::time::interval(Duration::from_millis(self.config.dedup_sweep_interval_ms));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!(conn_id, "Shutdown signal received, closing stream");
                    self.set_state(ConnectionState::Closing);
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(error = %e, "Failed to send close frame during shutdown");
                    }
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }

                () = self.reconnect_notify.notified() => {
                    info!(conn_id, "Forced reconnect, closing stream");
                    self.set_state(ConnectionState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    return Err(WsError::ReconnectRequested);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(conn_id, &text).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.heartbeat.record_ack();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(conn_id, code, %reason, "Stream closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            // Log only; the reconnect decision belongs to the
                            // close path so error and close never both schedule one.
                            error!(conn_id, error = %e, "Stream read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!(conn_id, "Stream ended");
                            return Err(WsError::ConnectionClosed {
                                code: 1006,
                                reason: "Stream ended".to_string(),
                            });
                        }
                        _ => {}
                    }
                }

                () = self.heartbeat.wait_for_check() => {
                    let missed = self.heartbeat.on_check();
                    if self.heartbeat.should_force_reconnect() {
                        error!(conn_id, missed, "Heartbeat failures exceeded limit");
                        return Err(WsError::HeartbeatTimeout { missed });
                    }
                    if self.heartbeat.should_send_ping() {
                        write.send(Message::Ping(Vec::new())).await?;
                        self.heartbeat.record_ping();
                        debug!(conn_id, "Sent keepalive ping");
                    }
                }

                _ = sweep.tick() => {
                    self.dedup.prune();
                }
            }
        }
    }

    async fn handle_text(&self, conn_id: u64, text: &str) -> WsResult<()> {
        // Stale-event immunity: frames from a superseded connection are
        // dropped before any side effect.
        if self.current_id.load(Ordering::SeqCst) != conn_id {
            debug!(conn_id, "Dropping frame from superseded connection");
            return Ok(());
        }

        self.heartbeat.record_message();

        let payload: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Unparseable frame dropped");
                return Ok(());
            }
        };

        if is_subscription_ack(&payload) {
            self.subscription.mark_subscribed();
            return Ok(());
        }

        let identity = EventIdentity::extract(&payload);
        if let Some(ref id) = identity {
            if !self.dedup.insert_if_new(&id.dedup_key()) {
                debug!(key = %id.dedup_key(), "Duplicate event dropped");
                return Ok(());
            }
        }

        // First data frame also confirms the subscription.
        if !self.subscription.is_subscribed() {
            self.subscription.mark_subscribed();
        }

        let event = StreamEvent {
            connection_id: conn_id,
            identity,
            payload,
        };
        if self.event_tx.send(event).await.is_err() {
            warn!("Event receiver dropped");
        }

        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(%state, "Connection state changed");
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay_ms as f64;
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = self.config.reconnect_backoff_factor.powi(exponent as i32);
        let delay = (base * factor) as u64;
        Duration::from_millis(delay.min(self.config.reconnect_max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_manager(buffer: usize) -> (ConnectionManager, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let config = ConnectionConfig {
            stream: "btcusdt@ticker".to_string(),
            ..Default::default()
        };
        (ConnectionManager::new(config, tx), rx)
    }

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_reconnect_attempts, 8);
        assert_eq!(config.heartbeat_interval_ms, 15000);
        assert_eq!(config.max_heartbeat_failures, 3);
    }

    #[test]
    fn test_backoff_delay_growth() {
        let (manager, _rx) = test_manager(1);

        let d1 = manager.backoff_delay(1);
        let d2 = manager.backoff_delay(2);
        let d3 = manager.backoff_delay(3);

        assert_eq!(d1, Duration::from_millis(1000));
        assert_eq!(d2, Duration::from_millis(1500));
        assert_eq!(d3, Duration::from_millis(2250));
        // Capped at the configured maximum
        assert_eq!(manager.backoff_delay(30), Duration::from_millis(30000));
    }

    #[tokio::test]
    async fn test_stale_connection_events_dropped() {
        let (manager, mut rx) = test_manager(4);
        manager.current_id.store(2, Ordering::SeqCst);

        let frame = json!({"e": "ticker", "s": "BTCUSDT", "E": 1, "c": "50000"}).to_string();

        // Frame captured by connection 1 while connection 2 is current
        manager.handle_text(1, &frame).await.unwrap();
        assert!(rx.try_recv().is_err());

        // Same frame from the current connection passes
        manager.handle_text(2, &frame).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_events_dropped() {
        let (manager, mut rx) = test_manager(4);
        manager.current_id.store(1, Ordering::SeqCst);

        let frame = json!({"e": "ticker", "s": "BTCUSDT", "E": 42, "c": "50000"}).to_string();

        manager.handle_text(1, &frame).await.unwrap();
        manager.handle_text(1, &frame).await.unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "duplicate must not be delivered");
    }

    #[tokio::test]
    async fn test_subscription_ack_consumed() {
        let (manager, mut rx) = test_manager(4);
        manager.current_id.store(1, Ordering::SeqCst);

        let ack = json!({"result": null, "id": 1}).to_string();
        manager.handle_text(1, &ack).await.unwrap();

        assert!(manager.is_subscribed());
        assert!(rx.try_recv().is_err(), "ack must not be forwarded");
    }

    #[tokio::test]
    async fn test_first_data_confirms_subscription() {
        let (manager, _rx) = test_manager(4);
        manager.current_id.store(1, Ordering::SeqCst);

        assert!(!manager.is_subscribed());
        let frame = json!({"e": "ticker", "s": "BTCUSDT", "E": 7, "c": "50000"}).to_string();
        manager.handle_text(1, &frame).await.unwrap();
        assert!(manager.is_subscribed());
    }

    #[test]
    fn test_force_reconnect_supersedes_id() {
        let (manager, _rx) = test_manager(1);
        manager.current_id.store(5, Ordering::SeqCst);

        manager.force_reconnect();
        assert_eq!(manager.current_connection_id(), 6);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_sets_failed() {
        let (tx, _rx) = mpsc::channel(1);
        let config = ConnectionConfig {
            // Nothing listens on the discard port; every dial is refused.
            url: "ws://127.0.0.1:9".to_string(),
            stream: "btcusdt@ticker".to_string(),
            max_reconnect_attempts: 2,
            reconnect_base_delay_ms: 1,
            reconnect_max_delay_ms: 2,
            ..Default::default()
        };
        let manager = ConnectionManager::new(config, tx);

        let result = manager.run().await;

        assert!(matches!(
            result,
            Err(WsError::ReconnectExhausted { attempts: 2 })
        ));
        assert!(manager.is_failed());
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_reset_clears_failed_state() {
        let (manager, _rx) = test_manager(1);
        manager.set_state(ConnectionState::Failed);
        assert!(manager.is_failed());

        manager.reset();
        assert!(!manager.is_failed());
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "OPEN");
        assert_eq!(ConnectionState::ReconnectWait.to_string(), "RECONNECT_WAIT");
        assert_eq!(ConnectionState::Failed.to_string(), "FAILED");
    }
}
