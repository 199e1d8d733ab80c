//! Application wiring.
//!
//! Builds the component graph (connection manager, price feed,
//! exchange clients, cycle controller) and exposes the start/stop
//! lifecycle plus the cycle-state and price-observer queries.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use ladder_core::PriceUpdate;
use ladder_engine::{CycleHandle, CycleState, TradingCycleController};
use ladder_exchange::{ExchangeClient, RequestSigner, RestExchangeClient, RetryExecutor};
use ladder_feed::{PriceFeed, PriceFeedHandle};
use ladder_ws::{ConnectionManager, ConnectionState, StreamEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const API_KEY_ENV: &str = "LADDER_API_KEY";
const API_SECRET_ENV: &str = "LADDER_API_SECRET";

/// Application builder.
pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Start every component and return the running handle set.
    pub async fn start(self) -> AppResult<RunningApp> {
        let config = self.config;
        info!(symbol = %config.symbol, side = %config.side, "Starting ladder bot");

        let (api_key, api_secret) = credentials_from_env()?;
        let signer = RequestSigner::new(api_secret);

        // Trading client plus dedicated quote clients for the feed.
        let exchange = Arc::new(RestExchangeClient::new(
            config.rest_config(&api_key),
            signer.clone(),
        )?);
        let quote_primary =
            RestExchangeClient::new(config.rest_config(&api_key), signer.clone())?;
        let quote_fallback = config
            .fallback_rest_config(&api_key)
            .map(|cfg| RestExchangeClient::new(cfg, signer.clone()))
            .transpose()?;

        // Connection manager feeding the price feed.
        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(1000);
        let connection = Arc::new(ConnectionManager::new(config.connection_config(), event_tx));
        let ws_task = {
            let connection = connection.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.run().await {
                    error!(error = %e, "Market-data connection failed permanently");
                }
            })
        };

        let feed = PriceFeed::new(
            config.feed_config(),
            connection.clone(),
            quote_primary,
            quote_fallback,
        );
        let feed_handle = feed.handle();
        let shared_price = feed_handle.shared();
        let feed_task = tokio::spawn(feed.run(event_rx));

        // Preflight: a signed account query proves the credentials before
        // any order can go out.
        let retry = RetryExecutor::default();
        let account = retry
            .execute(|| exchange.get_account_info(), 3)
            .await
            .map_err(AppError::Exchange)?;
        info!(
            available = %account.available_balance,
            total = %account.total_balance,
            "Account verified"
        );

        // Leverage is configured once per session, before the first cycle.
        retry
            .execute(
                || exchange.set_leverage(&config.symbol, config.leverage),
                3,
            )
            .await
            .map_err(AppError::Exchange)?;

        let controller =
            TradingCycleController::new(config.cycle_config(), exchange, shared_price);
        let cycle_handle = controller.handle();
        let cycle_task = tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!(error = %e, "Trading cycle halted");
            }
        });

        Ok(RunningApp {
            connection,
            feed: feed_handle,
            cycle: cycle_handle,
            ws_task,
            feed_task,
            cycle_task,
            grace: config.stop_grace(),
        })
    }
}

fn credentials_from_env() -> AppResult<(String, String)> {
    let api_key = std::env::var(API_KEY_ENV)
        .map_err(|_| AppError::Config(format!("{API_KEY_ENV} not set")))?;
    let api_secret = std::env::var(API_SECRET_ENV)
        .map_err(|_| AppError::Config(format!("{API_SECRET_ENV} not set")))?;
    Ok((api_key, api_secret))
}

/// Handles over the running component set.
pub struct RunningApp {
    connection: Arc<ConnectionManager>,
    feed: PriceFeedHandle,
    cycle: CycleHandle,
    ws_task: JoinHandle<()>,
    feed_task: JoinHandle<()>,
    cycle_task: JoinHandle<()>,
    grace: Duration,
}

impl RunningApp {
    /// Current cycle state.
    pub fn cycle_state(&self) -> CycleState {
        self.cycle.state()
    }

    /// Current market-data connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Register a price-update observer.
    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.feed.subscribe()
    }

    /// Stop everything, in order: feed timers and connection first, then
    /// the cycle (with its optional best-effort flatten), bounded by the
    /// configured grace period.
    pub async fn stop(self) {
        info!("Stopping ladder bot");

        self.feed.shutdown();
        self.connection.shutdown();
        self.cycle.stop();

        if tokio::time::timeout(self.grace, self.cycle_task)
            .await
            .is_err()
        {
            warn!("Cycle controller did not stop within the grace period");
        }

        self.ws_task.abort();
        self.feed_task.abort();
        info!("Ladder bot stopped");
    }
}
