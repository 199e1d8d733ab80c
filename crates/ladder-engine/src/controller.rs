//! Trading cycle controller.
//!
//! The state machine driving one full trade cycle: place the entry
//! ladder, wait for a fill, monitor exit conditions, close, reset, and
//! go again. All state lives on a single control loop; suspension
//! happens only at I/O boundaries, so no locks guard the cycle state.
//!
//! Risk gate: when a position or order query fails after retries, no
//! orders are placed that tick. It is safer to skip a cycle than to act
//! on unknown exposure.

use crate::error::{EngineError, EngineResult};
use crate::exits::{ExitConfig, ExitEvaluator, ExitSignal};
use crate::planner::{plan, LadderConfig, LadderOrder};
use ladder_core::{Position, PositionSide, Price, Size};
use ladder_exchange::{ExchangeClient, ExchangeError, OpenOrder, OrderSpec, RetryExecutor};
use ladder_feed::SharedPrice;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cycle state. Owned exclusively by the controller and mutated only on
/// its control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Placing,
    AwaitingFill,
    PositionOpen,
    Closing,
    Resetting,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Placing => write!(f, "PLACING"),
            Self::AwaitingFill => write!(f, "AWAITING_FILL"),
            Self::PositionOpen => write!(f, "POSITION_OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Resetting => write!(f, "RESETTING"),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub symbol: String,
    pub side: PositionSide,
    pub ladder: LadderConfig,
    pub exits: ExitConfig,
    /// Poll interval for the control loop.
    pub poll_interval_ms: u64,
    /// How long the ladder may sit unfilled before a reprice cycle.
    pub no_fill_timeout_ms: u64,
    /// Delay between sequential rung submissions.
    pub order_spacing_ms: u64,
    /// Settle delay before cancel verification.
    pub settle_delay_ms: u64,
    /// Maximum feed age accepted as a usable price.
    pub max_price_age_ms: i64,
    /// Attempts per exchange call (through the retry executor).
    pub query_attempts: u32,
    /// Base delay for the retry executor.
    pub retry_base_delay_ms: u64,
    /// Keep pre-existing open orders instead of cancelling them.
    pub keep_existing_orders: bool,
    /// Re-enter PLACING directly after a reset instead of IDLE.
    pub auto_restart: bool,
    /// Flatten any open position on shutdown.
    pub flatten_on_stop: bool,
    /// Grace period for the shutdown flatten.
    pub stop_grace_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            side: PositionSide::Long,
            ladder: LadderConfig {
                max_move_pct: rust_decimal::Decimal::from(3),
                total_amount: rust_decimal::Decimal::from(100),
                rung_count: 3,
                increment_pct: rust_decimal::Decimal::from(50),
                min_order_amount: rust_decimal::Decimal::from(10),
                price_tick: rust_decimal::Decimal::new(1, 2),
                qty_step: rust_decimal::Decimal::new(1, 3),
            },
            exits: ExitConfig {
                take_profit_pct: rust_decimal::Decimal::new(5, 1),
                stop_loss_pct: rust_decimal::Decimal::from(2),
                trailing: None,
            },
            poll_interval_ms: 2000,
            no_fill_timeout_ms: 1_800_000,
            order_spacing_ms: 200,
            settle_delay_ms: 1000,
            max_price_age_ms: 10_000,
            query_attempts: 3,
            retry_base_delay_ms: 500,
            keep_existing_orders: false,
            auto_restart: true,
            flatten_on_stop: false,
            stop_grace_ms: 10_000,
        }
    }
}

/// Pending close action carried across CLOSING ticks.
#[derive(Debug)]
struct CloseRequest {
    quantity: Size,
    reason: ExitSignal,
    /// Guards against duplicate market orders when residual cleanup
    /// fails and CLOSING is re-entered.
    submitted: bool,
}

/// Cloneable control handle for a running controller.
#[derive(Clone)]
pub struct CycleHandle {
    state_rx: watch::Receiver<CycleState>,
    stopped: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl CycleHandle {
    /// Current cycle state.
    pub fn state(&self) -> CycleState {
        *self.state_rx.borrow()
    }

    /// Request shutdown. Idempotent: a second call is a no-op and
    /// produces no duplicate flatten or cancel side effects.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stop already requested");
            return;
        }
        info!("Cycle stop requested");
        self.shutdown.cancel();
    }
}

/// Trading cycle controller.
pub struct TradingCycleController<E: ExchangeClient> {
    config: CycleConfig,
    exchange: Arc<E>,
    price: SharedPrice,
    retry: RetryExecutor,
    state_tx: watch::Sender<CycleState>,
    /// Per-cycle exit evaluator, created on fill detection.
    exits: Option<ExitEvaluator>,
    /// Independent no-fill timer; armed when the ladder is placed.
    no_fill_deadline: Option<Instant>,
    /// Pending close action while in CLOSING.
    close_request: Option<CloseRequest>,
    stopped: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl<E: ExchangeClient> TradingCycleController<E> {
    pub fn new(config: CycleConfig, exchange: Arc<E>, price: SharedPrice) -> Self {
        let (state_tx, _) = watch::channel(CycleState::Idle);
        let retry = RetryExecutor::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_secs(10),
        );
        Self {
            config,
            exchange,
            price,
            retry,
            state_tx,
            exits: None,
            no_fill_deadline: None,
            close_request: None,
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Control handle; take before moving the controller into its task.
    pub fn handle(&self) -> CycleHandle {
        CycleHandle {
            state_rx: self.state_tx.subscribe(),
            stopped: self.stopped.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Current cycle state.
    pub fn state(&self) -> CycleState {
        *self.state_tx.borrow()
    }

    /// Run the control loop until shutdown or a halt condition.
    pub async fn run(mut self) -> EngineResult<()> {
        info!(
            symbol = %self.config.symbol,
            side = %self.config.side,
            "Trading cycle controller started"
        );

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    self.on_shutdown().await;
                    return Ok(());
                }

                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        if is_fatal(&e) {
                            error!(error = %e, "Trading halted");
                            return Err(e);
                        }
                        // Action blocked this tick; state is unchanged and
                        // the next tick retries from the same place.
                        warn!(error = %e, state = %self.state(), "Cycle tick failed");
                    }
                }
            }
        }
    }

    /// Advance the state machine by one tick.
    async fn tick(&mut self) -> EngineResult<()> {
        match self.state() {
            CycleState::Idle => self.tick_idle().await,
            CycleState::Placing => self.tick_placing().await,
            CycleState::AwaitingFill => self.tick_awaiting_fill().await,
            CycleState::PositionOpen => self.tick_position_open().await,
            CycleState::Closing => self.tick_closing().await,
            CycleState::Resetting => self.tick_resetting(),
        }
    }

    async fn tick_idle(&mut self) -> EngineResult<()> {
        if self.usable_price().await.is_none() {
            debug!("No usable price, staying idle");
            return Ok(());
        }
        self.set_state(CycleState::Placing);
        Ok(())
    }

    async fn tick_placing(&mut self) -> EngineResult<()> {
        let Some(price) = self.usable_price().await else {
            warn!("Price went stale before placement, back to idle");
            self.set_state(CycleState::Idle);
            return Ok(());
        };

        // Risk gate: an unanswered open-orders query blocks placement.
        let open = self.query_open_orders().await?;
        if !open.is_empty() {
            if self.config.keep_existing_orders {
                info!(count = open.len(), "Keeping existing orders, awaiting fill");
                self.arm_no_fill_timer();
                self.set_state(CycleState::AwaitingFill);
                return Ok(());
            }
            info!(count = open.len(), "Cancelling pre-existing orders");
            self.cancel_and_verify().await?;
        }

        let ladder = plan(price, self.config.side, &self.config.ladder);
        if ladder.is_empty() {
            warn!(%price, "Ladder plan produced no rungs, cannot trade this cycle");
            self.set_state(CycleState::Idle);
            return Ok(());
        }

        let placed = self.place_ladder(&ladder).await?;
        if placed == 0 {
            warn!("No rungs placed, back to idle");
            self.set_state(CycleState::Idle);
            return Ok(());
        }

        info!(placed, total = ladder.len(), "Ladder placed");
        self.arm_no_fill_timer();
        self.set_state(CycleState::AwaitingFill);
        Ok(())
    }

    async fn tick_awaiting_fill(&mut self) -> EngineResult<()> {
        match self.query_position().await? {
            Some(position) => {
                info!(
                    entry = %position.entry_price,
                    quantity = %position.quantity,
                    "Position detected"
                );
                self.no_fill_deadline = None;
                self.exits = Some(ExitEvaluator::new(
                    self.config.exits.clone(),
                    self.config.side,
                    position.entry_price,
                ));
                self.set_state(CycleState::PositionOpen);
            }
            None => {
                if self.no_fill_expired() {
                    warn!("No fill within timeout, cancelling and repricing");
                    self.cancel_and_verify().await?;
                    self.no_fill_deadline = None;
                    self.set_state(CycleState::Placing);
                }
            }
        }
        Ok(())
    }

    async fn tick_position_open(&mut self) -> EngineResult<()> {
        let Some(position) = self.query_position().await? else {
            info!("Position no longer present, resetting cycle");
            self.set_state(CycleState::Resetting);
            return Ok(());
        };

        if self.exits.is_none() {
            self.exits = Some(ExitEvaluator::new(
                self.config.exits.clone(),
                self.config.side,
                position.entry_price,
            ));
        }
        let Some(exits) = self.exits.as_mut() else {
            return Ok(());
        };
        // Additional rung fills move the average entry.
        exits.update_entry(position.entry_price);

        // Exits fire on the last known price even when the feed is
        // degraded; only new placements require freshness.
        let Some(update) = self.price.latest() else {
            debug!("No price observation yet");
            return Ok(());
        };

        debug!(
            price = %update.price,
            source = %update.source,
            entry = %position.entry_price,
            unrealized = %position.unrealized_pnl,
            "Position poll"
        );

        if let Some(signal) = exits.on_price(update.price) {
            info!(reason = %signal, price = %update.price, "Exit condition met");
            self.close_request = Some(CloseRequest {
                quantity: position.quantity,
                reason: signal,
                submitted: false,
            });
            self.set_state(CycleState::Closing);
        }
        Ok(())
    }

    async fn tick_closing(&mut self) -> EngineResult<()> {
        let Some(mut request) = self.close_request.take() else {
            self.set_state(CycleState::Resetting);
            return Ok(());
        };

        if !request.submitted {
            info!(reason = %request.reason, "Closing position");
            match self.submit_close(request.quantity).await {
                Ok(()) => request.submitted = true,
                Err(e) => {
                    // Stay in CLOSING; the next tick retries the flatten.
                    self.close_request = Some(request);
                    return Err(e);
                }
            }
        }

        // Keep the submitted flag across a failed cleanup so CLOSING
        // never double-sends the market order.
        self.close_request = Some(request);
        self.cancel_and_verify().await?;
        self.close_request = None;
        self.set_state(CycleState::Resetting);
        Ok(())
    }

    fn tick_resetting(&mut self) -> EngineResult<()> {
        self.exits = None;
        self.no_fill_deadline = None;
        self.close_request = None;

        let next = if self.config.auto_restart {
            CycleState::Placing
        } else {
            CycleState::Idle
        };
        info!(next = %next, "Cycle reset");
        self.set_state(next);
        Ok(())
    }

    async fn on_shutdown(&mut self) {
        info!("Shutdown requested, tearing down cycle");

        if self.config.flatten_on_stop {
            let grace = Duration::from_millis(self.config.stop_grace_ms);
            if tokio::time::timeout(grace, self.flatten_best_effort())
                .await
                .is_err()
            {
                warn!("Flatten did not complete within grace period");
            }
        }

        self.set_state(CycleState::Idle);
    }

    /// Best-effort position flatten and order cleanup during shutdown.
    /// Tolerates failure at every step.
    async fn flatten_best_effort(&mut self) {
        match self.query_position().await {
            Ok(Some(position)) => {
                info!(quantity = %position.quantity, "Flattening position on shutdown");
                if let Err(e) = self.submit_close(position.quantity).await {
                    warn!(error = %e, "Shutdown flatten failed");
                }
            }
            Ok(None) => debug!("No position to flatten"),
            Err(e) => warn!(error = %e, "Position query failed during shutdown"),
        }

        let symbol = self.config.symbol.clone();
        let cancel = self
            .retry
            .execute(
                || self.exchange.cancel_all_orders(&symbol),
                self.config.query_attempts,
            )
            .await;
        if let Err(e) = cancel {
            warn!(error = %e, "Open-order cancel failed during shutdown");
        }
    }

    // ------------------------------------------------------------------
    // Exchange interactions
    // ------------------------------------------------------------------

    /// Latest fresh feed price, falling back to a direct quote.
    async fn usable_price(&self) -> Option<Price> {
        if let Some(update) = self.price.latest_fresh(self.config.max_price_age_ms) {
            return Some(update.price);
        }

        let symbol = self.config.symbol.clone();
        match self
            .retry
            .execute(|| self.exchange.get_ticker(&symbol), self.config.query_attempts)
            .await
        {
            Ok(ticker) => Some(ticker.last_price),
            Err(e) => {
                warn!(error = %e, "No usable price from feed or direct quote");
                None
            }
        }
    }

    async fn query_open_orders(&self) -> EngineResult<Vec<OpenOrder>> {
        let symbol = self.config.symbol.clone();
        let orders = self
            .retry
            .execute(
                || self.exchange.get_open_orders(&symbol),
                self.config.query_attempts,
            )
            .await?;
        Ok(orders)
    }

    /// Position on the configured side, if one is open.
    async fn query_position(&self) -> EngineResult<Option<Position>> {
        let symbol = self.config.symbol.clone();
        let positions = self
            .retry
            .execute(
                || self.exchange.get_positions(&symbol),
                self.config.query_attempts,
            )
            .await?;
        Ok(positions
            .into_iter()
            .find(|p| p.side == self.config.side && !p.is_flat()))
    }

    /// Submit the ladder sequentially with an inter-request delay.
    ///
    /// Insufficient funds aborts the remaining rungs without touching
    /// the ones already placed; other rejections skip the single rung.
    async fn place_ladder(&self, ladder: &[LadderOrder]) -> EngineResult<usize> {
        let mut placed = 0usize;

        for order in ladder {
            let spec = OrderSpec::limit(
                self.config.symbol.clone(),
                order.side,
                order.position_side,
                order.quantity,
                order.price,
            );

            let result = self
                .retry
                .execute(|| self.exchange.create_order(&spec), self.config.query_attempts)
                .await;

            match result {
                Ok(receipt) => {
                    placed += 1;
                    info!(
                        rung = order.rung,
                        price = %order.price,
                        quantity = %order.quantity,
                        order_id = %receipt.order_id,
                        "Rung placed"
                    );
                }
                Err(ExchangeError::InsufficientFunds(msg)) => {
                    warn!(rung = order.rung, %msg, "Insufficient funds, aborting remaining rungs");
                    break;
                }
                Err(ExchangeError::Auth(msg)) => {
                    return Err(EngineError::Halted(format!("auth failure: {msg}")));
                }
                Err(e) => {
                    warn!(rung = order.rung, error = %e, "Rung rejected, skipping");
                }
            }

            if self.config.order_spacing_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.order_spacing_ms)).await;
            }
        }

        Ok(placed)
    }

    async fn submit_close(&self, quantity: Size) -> EngineResult<()> {
        let spec = OrderSpec::market_close(self.config.symbol.clone(), self.config.side, quantity);
        let receipt = self
            .retry
            .execute(|| self.exchange.create_order(&spec), self.config.query_attempts)
            .await?;
        info!(order_id = %receipt.order_id, quantity = %quantity, "Close order submitted");
        Ok(())
    }

    /// Cancel all open orders, settle, and verify nothing remains.
    async fn cancel_and_verify(&self) -> EngineResult<()> {
        let symbol = self.config.symbol.clone();
        self.retry
            .execute(
                || self.exchange.cancel_all_orders(&symbol),
                self.config.query_attempts,
            )
            .await?;

        if self.config.settle_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        }

        let remaining = self.query_open_orders().await?;
        if !remaining.is_empty() {
            warn!(count = remaining.len(), "Orders still open after cancel");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers and state
    // ------------------------------------------------------------------

    fn arm_no_fill_timer(&mut self) {
        self.no_fill_deadline =
            Some(Instant::now() + Duration::from_millis(self.config.no_fill_timeout_ms));
    }

    fn no_fill_expired(&self) -> bool {
        self.no_fill_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn set_state(&self, next: CycleState) {
        let previous = self.state();
        if previous == next {
            return;
        }
        info!(from = %previous, to = %next, "Cycle state transition");
        let _ = self.state_tx.send_replace(next);
    }
}

fn is_fatal(error: &EngineError) -> bool {
    matches!(error, EngineError::Halted(_))
        || matches!(error, EngineError::Exchange(ExchangeError::Auth(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::{OrderStatus, OrderType, PriceSource, PriceUpdate};
    use ladder_exchange::{AccountInfo, BoxFuture, ExchangeResult, OrderReceipt, Ticker};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct MockExchange {
        ticker: Mutex<Option<Price>>,
        positions: Mutex<Vec<Position>>,
        open_orders: Mutex<Vec<OpenOrder>>,
        open_orders_fail: Mutex<bool>,
        create_script: Mutex<VecDeque<ExchangeResult<OrderReceipt>>>,
        created: Mutex<Vec<OrderSpec>>,
        cancel_calls: AtomicU32,
    }

    fn receipt(id: &str) -> OrderReceipt {
        OrderReceipt {
            order_id: id.to_string(),
            client_order_id: None,
            status: OrderStatus::New,
        }
    }

    impl ExchangeClient for MockExchange {
        fn get_ticker<'a>(&'a self, symbol: &'a str) -> BoxFuture<'a, ExchangeResult<Ticker>> {
            Box::pin(async move {
                let price = *self.ticker.lock();
                match price {
                    Some(last_price) => Ok(Ticker {
                        symbol: symbol.to_string(),
                        last_price,
                    }),
                    None => Err(ExchangeError::Transport("no ticker".to_string())),
                }
            })
        }

        fn get_positions<'a>(
            &'a self,
            _symbol: &'a str,
        ) -> BoxFuture<'a, ExchangeResult<Vec<Position>>> {
            Box::pin(async move { Ok(self.positions.lock().clone()) })
        }

        fn create_order<'a>(
            &'a self,
            spec: &'a OrderSpec,
        ) -> BoxFuture<'a, ExchangeResult<OrderReceipt>> {
            Box::pin(async move {
                self.created.lock().push(spec.clone());
                self.create_script
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| Ok(receipt("1")))
            })
        }

        fn get_open_orders<'a>(
            &'a self,
            _symbol: &'a str,
        ) -> BoxFuture<'a, ExchangeResult<Vec<OpenOrder>>> {
            Box::pin(async move {
                if *self.open_orders_fail.lock() {
                    return Err(ExchangeError::Transport("query down".to_string()));
                }
                Ok(self.open_orders.lock().clone())
            })
        }

        fn cancel_all_orders<'a>(&'a self, _symbol: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
            Box::pin(async move {
                self.cancel_calls.fetch_add(1, Ordering::SeqCst);
                self.open_orders.lock().clear();
                Ok(())
            })
        }

        fn get_account_info(&self) -> BoxFuture<'_, ExchangeResult<AccountInfo>> {
            Box::pin(async move {
                Ok(AccountInfo {
                    total_balance: Decimal::from(1000),
                    available_balance: Decimal::from(1000),
                })
            })
        }

        fn set_leverage<'a>(
            &'a self,
            _symbol: &'a str,
            _leverage: u32,
        ) -> BoxFuture<'a, ExchangeResult<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn test_config() -> CycleConfig {
        CycleConfig {
            symbol: "BTCUSDT".to_string(),
            order_spacing_ms: 0,
            settle_delay_ms: 0,
            query_attempts: 1,
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    fn harness(config: CycleConfig) -> (TradingCycleController<MockExchange>, Arc<MockExchange>) {
        let mock = Arc::new(MockExchange::default());
        let controller = TradingCycleController::new(config, mock.clone(), SharedPrice::new());
        (controller, mock)
    }

    fn long_position(entry: Decimal, quantity: Decimal) -> Position {
        Position::new(
            PositionSide::Long,
            Size::new(quantity),
            Price::new(entry),
            Decimal::ZERO,
        )
    }

    fn stream_price(shared: &SharedPrice, price: Decimal) {
        shared.set(PriceUpdate::new(
            "BTCUSDT",
            Price::new(price),
            PriceSource::Stream,
        ));
    }

    #[tokio::test]
    async fn test_idle_stays_without_usable_price() {
        let (mut controller, mock) = harness(test_config());

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::Idle);
        assert!(mock.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_advances_on_direct_quote() {
        let (mut controller, mock) = harness(test_config());
        *mock.ticker.lock() = Some(Price::new(dec!(100)));

        controller.tick().await.unwrap();
        assert_eq!(controller.state(), CycleState::Placing);
    }

    #[tokio::test]
    async fn test_placing_submits_ladder_and_awaits_fill() {
        let (mut controller, mock) = harness(test_config());
        *mock.ticker.lock() = Some(Price::new(dec!(100)));
        controller.set_state(CycleState::Placing);

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::AwaitingFill);
        let created = mock.created.lock();
        assert_eq!(created.len(), 3);
        assert!(created
            .iter()
            .all(|spec| spec.order_type == OrderType::Limit));
        assert!(controller.no_fill_deadline.is_some());
    }

    #[tokio::test]
    async fn test_placing_blocked_when_query_fails() {
        let (mut controller, mock) = harness(test_config());
        *mock.ticker.lock() = Some(Price::new(dec!(100)));
        *mock.open_orders_fail.lock() = true;
        controller.set_state(CycleState::Placing);

        let result = controller.tick().await;

        // Never trade blind: no orders, no transition
        assert!(result.is_err());
        assert_eq!(controller.state(), CycleState::Placing);
        assert!(mock.created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_placing_keeps_existing_orders_when_configured() {
        let config = CycleConfig {
            keep_existing_orders: true,
            ..test_config()
        };
        let (mut controller, mock) = harness(config);
        *mock.ticker.lock() = Some(Price::new(dec!(100)));
        mock.open_orders.lock().push(OpenOrder {
            order_id: "7".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: ladder_core::OrderSide::Buy,
            price: Price::new(dec!(99)),
            quantity: Size::new(dec!(0.1)),
        });
        controller.set_state(CycleState::Placing);

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::AwaitingFill);
        assert!(mock.created.lock().is_empty());
        assert_eq!(mock.cancel_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_placing_cancels_existing_orders_by_default() {
        let (mut controller, mock) = harness(test_config());
        *mock.ticker.lock() = Some(Price::new(dec!(100)));
        mock.open_orders.lock().push(OpenOrder {
            order_id: "7".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: ladder_core::OrderSide::Buy,
            price: Price::new(dec!(99)),
            quantity: Size::new(dec!(0.1)),
        });
        controller.set_state(CycleState::Placing);

        controller.tick().await.unwrap();

        assert_eq!(mock.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.created.lock().len(), 3);
        assert_eq!(controller.state(), CycleState::AwaitingFill);
    }

    #[tokio::test]
    async fn test_insufficient_funds_aborts_remaining_rungs() {
        let (mut controller, mock) = harness(test_config());
        *mock.ticker.lock() = Some(Price::new(dec!(100)));
        {
            let mut script = mock.create_script.lock();
            script.push_back(Ok(receipt("1")));
            script.push_back(Err(ExchangeError::InsufficientFunds(
                "margin".to_string(),
            )));
        }
        controller.set_state(CycleState::Placing);

        controller.tick().await.unwrap();

        // Third rung never attempted; one successful placement is enough
        assert_eq!(mock.created.lock().len(), 2);
        assert_eq!(controller.state(), CycleState::AwaitingFill);
    }

    #[tokio::test]
    async fn test_auth_error_halts() {
        let (mut controller, mock) = harness(test_config());
        *mock.ticker.lock() = Some(Price::new(dec!(100)));
        mock.create_script
            .lock()
            .push_back(Err(ExchangeError::Auth("bad key".to_string())));
        controller.set_state(CycleState::Placing);

        let result = controller.tick().await;
        assert!(matches!(result, Err(EngineError::Halted(_))));
    }

    #[tokio::test]
    async fn test_awaiting_fill_detects_position() {
        let (mut controller, mock) = harness(test_config());
        mock.positions.lock().push(long_position(dec!(100), dec!(0.5)));
        controller.set_state(CycleState::AwaitingFill);
        controller.arm_no_fill_timer();

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::PositionOpen);
        assert!(controller.no_fill_deadline.is_none());
        assert_eq!(
            controller.exits.as_ref().map(|e| e.entry_price()),
            Some(Price::new(dec!(100)))
        );
    }

    #[tokio::test]
    async fn test_no_fill_timeout_cancels_and_reprices() {
        let (mut controller, mock) = harness(test_config());
        mock.open_orders.lock().push(OpenOrder {
            order_id: "7".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: ladder_core::OrderSide::Buy,
            price: Price::new(dec!(99)),
            quantity: Size::new(dec!(0.1)),
        });
        controller.set_state(CycleState::AwaitingFill);
        controller.no_fill_deadline = Some(Instant::now() - Duration::from_millis(1));

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::Placing);
        assert_eq!(mock.cancel_calls.load(Ordering::SeqCst), 1);
        // Verification query sees an empty book after the cancel
        assert!(mock.open_orders.lock().is_empty());
    }

    #[tokio::test]
    async fn test_take_profit_transitions_to_closing() {
        let (mut controller, mock) = harness(test_config());
        mock.positions.lock().push(long_position(dec!(100), dec!(0.5)));
        stream_price(&controller.price, dec!(100.6));
        controller.set_state(CycleState::PositionOpen);

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::Closing);
        let request = controller.close_request.as_ref().unwrap();
        assert_eq!(request.quantity, Size::new(dec!(0.5)));
        assert!(matches!(request.reason, ExitSignal::TakeProfit { .. }));
    }

    #[tokio::test]
    async fn test_small_move_does_not_close() {
        let (mut controller, mock) = harness(test_config());
        mock.positions.lock().push(long_position(dec!(100), dec!(0.5)));
        stream_price(&controller.price, dec!(99.9));
        controller.set_state(CycleState::PositionOpen);

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::PositionOpen);
        assert!(controller.close_request.is_none());
    }

    #[tokio::test]
    async fn test_closing_submits_market_order_and_cleans_up() {
        let (mut controller, mock) = harness(test_config());
        controller.close_request = Some(CloseRequest {
            quantity: Size::new(dec!(0.5)),
            reason: ExitSignal::TakeProfit {
                profit_pct: dec!(0.6),
            },
            submitted: false,
        });
        controller.set_state(CycleState::Closing);

        controller.tick().await.unwrap();

        assert_eq!(controller.state(), CycleState::Resetting);
        let created = mock.created.lock();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].order_type, OrderType::Market);
        assert_eq!(created[0].side, ladder_core::OrderSide::Sell);
        assert!(created[0].reduce_only);
        assert_eq!(mock.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closing_does_not_resubmit_after_cleanup_failure() {
        let (mut controller, mock) = harness(test_config());
        controller.close_request = Some(CloseRequest {
            quantity: Size::new(dec!(0.5)),
            reason: ExitSignal::TakeProfit {
                profit_pct: dec!(0.6),
            },
            submitted: true,
        });
        controller.set_state(CycleState::Closing);

        controller.tick().await.unwrap();

        // Market order already went out in a previous tick
        assert!(mock.created.lock().is_empty());
        assert_eq!(controller.state(), CycleState::Resetting);
    }

    #[tokio::test]
    async fn test_position_disappearance_resets() {
        let (mut controller, _mock) = harness(test_config());
        controller.set_state(CycleState::PositionOpen);

        controller.tick().await.unwrap();
        assert_eq!(controller.state(), CycleState::Resetting);
    }

    #[tokio::test]
    async fn test_resetting_honors_auto_restart() {
        let (mut controller, _mock) = harness(test_config());
        controller.set_state(CycleState::Resetting);
        controller.tick().await.unwrap();
        assert_eq!(controller.state(), CycleState::Placing);

        let config = CycleConfig {
            auto_restart: false,
            ..test_config()
        };
        let (mut controller, _mock) = harness(config);
        controller.set_state(CycleState::Resetting);
        controller.tick().await.unwrap();
        assert_eq!(controller.state(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_reset_clears_cycle_state() {
        let (mut controller, _mock) = harness(test_config());
        controller.exits = Some(ExitEvaluator::new(
            controller.config.exits.clone(),
            PositionSide::Long,
            Price::new(dec!(100)),
        ));
        controller.arm_no_fill_timer();
        controller.set_state(CycleState::Resetting);

        controller.tick().await.unwrap();

        assert!(controller.exits.is_none());
        assert!(controller.no_fill_deadline.is_none());
        assert!(controller.close_request.is_none());
    }
}
