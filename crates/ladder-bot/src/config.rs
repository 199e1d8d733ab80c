//! Application configuration.
//!
//! Loaded from TOML, validated before any component is constructed.
//! API credentials come from environment variables, never from the
//! config file.

use crate::error::{AppError, AppResult};
use ladder_core::PositionSide;
use ladder_engine::{CycleConfig, ExitConfig, LadderConfig, TrailingConfig};
use ladder_exchange::RestClientConfig;
use ladder_feed::PriceFeedConfig;
use ladder_ws::{ConnectionConfig, DedupConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Position direction for the laddered strategy.
    pub side: PositionSide,
    /// Leverage applied once at startup.
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Exchange endpoints.
    #[serde(default)]
    pub endpoints: EndpointSettings,
    /// WebSocket connection settings.
    #[serde(default)]
    pub websocket: WsSettings,
    /// Price feed settings.
    #[serde(default)]
    pub feed: FeedSettings,
    /// Entry ladder parameters.
    pub ladder: LadderSettings,
    /// Exit thresholds.
    pub exits: ExitSettings,
    /// Cycle controller settings.
    #[serde(default)]
    pub cycle: CycleSettings,
}

fn default_leverage() -> u32 {
    1
}

/// Exchange endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    /// Streaming endpoint URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Primary REST endpoint URL.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Secondary REST endpoint for the feed's price fallback.
    #[serde(default)]
    pub fallback_rest_url: Option<String>,
    /// Signature receive window.
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_timeout_ms() -> u64 {
    10000
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            fallback_rest_url: None,
            recv_window_ms: default_recv_window_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsSettings {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,
}

fn default_max_reconnect_attempts() -> u32 {
    8
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30000
}

fn default_heartbeat_interval_ms() -> u64 {
    15000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5000
}

fn default_max_heartbeat_failures() -> u32 {
    3
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
        }
    }
}

/// Price feed settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedSettings {
    #[serde(default = "default_min_publish_interval_ms")]
    pub min_publish_interval_ms: u64,
    #[serde(default = "default_stale_fetch_threshold_ms")]
    pub stale_fetch_threshold_ms: i64,
    #[serde(default = "default_stale_reconnect_threshold_ms")]
    pub stale_reconnect_threshold_ms: i64,
    #[serde(default = "default_staleness_check_interval_ms")]
    pub staleness_check_interval_ms: u64,
    #[serde(default = "default_rest_attempts")]
    pub rest_attempts: u32,
}

fn default_min_publish_interval_ms() -> u64 {
    250
}

fn default_stale_fetch_threshold_ms() -> i64 {
    5000
}

fn default_stale_reconnect_threshold_ms() -> i64 {
    20000
}

fn default_staleness_check_interval_ms() -> u64 {
    1000
}

fn default_rest_attempts() -> u32 {
    3
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            min_publish_interval_ms: default_min_publish_interval_ms(),
            stale_fetch_threshold_ms: default_stale_fetch_threshold_ms(),
            stale_reconnect_threshold_ms: default_stale_reconnect_threshold_ms(),
            staleness_check_interval_ms: default_staleness_check_interval_ms(),
            rest_attempts: default_rest_attempts(),
        }
    }
}

/// Entry ladder parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderSettings {
    /// Maximum adverse move covered, in percent.
    pub max_move_pct: Decimal,
    /// Total quote-currency budget across all rungs.
    pub total_amount: Decimal,
    /// Number of rungs.
    pub rung_count: u32,
    /// Amount growth per rung, in percent.
    pub increment_pct: Decimal,
    /// Venue minimum notional per order.
    pub min_order_amount: Decimal,
    /// Venue price tick.
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
    /// Venue quantity step.
    #[serde(default = "default_qty_step")]
    pub qty_step: Decimal,
}

fn default_price_tick() -> Decimal {
    Decimal::new(1, 2)
}

fn default_qty_step() -> Decimal {
    Decimal::new(1, 3)
}

/// Exit thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSettings {
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    #[serde(default)]
    pub trailing: Option<TrailingSettings>,
}

/// Trailing stop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingSettings {
    pub activation_pct: Decimal,
    pub distance_pct: Decimal,
}

/// Cycle controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_no_fill_timeout_ms")]
    pub no_fill_timeout_ms: u64,
    #[serde(default = "default_order_spacing_ms")]
    pub order_spacing_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_max_price_age_ms")]
    pub max_price_age_ms: i64,
    #[serde(default = "default_query_attempts")]
    pub query_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default)]
    pub keep_existing_orders: bool,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default)]
    pub flatten_on_stop: bool,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_no_fill_timeout_ms() -> u64 {
    1_800_000
}

fn default_order_spacing_ms() -> u64 {
    200
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_max_price_age_ms() -> i64 {
    10_000
}

fn default_query_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_auto_restart() -> bool {
    true
}

fn default_stop_grace_ms() -> u64 {
    10_000
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            no_fill_timeout_ms: default_no_fill_timeout_ms(),
            order_spacing_ms: default_order_spacing_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            max_price_age_ms: default_max_price_age_ms(),
            query_attempts: default_query_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            keep_existing_orders: false,
            auto_restart: default_auto_restart(),
            flatten_on_stop: false,
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration: explicit path, else `LADDER_CONFIG`, else the
    /// default location.
    pub fn load(path: Option<&str>) -> AppResult<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("LADDER_CONFIG").ok())
            .unwrap_or_else(|| "config/default.toml".to_string());

        if !Path::new(&path).exists() {
            return Err(AppError::Config(format!("Config file not found: {path}")));
        }
        Self::from_file(&path)
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every static constraint before construction.
    pub fn validate(&self) -> AppResult<()> {
        if self.symbol.is_empty() {
            return Err(AppError::Config("symbol must not be empty".to_string()));
        }
        if self.leverage == 0 {
            return Err(AppError::Config("leverage must be at least 1".to_string()));
        }
        if self.ladder.rung_count == 0 {
            return Err(AppError::Config("ladder.rung_count must be at least 1".to_string()));
        }

        let positives: [(&str, Decimal); 5] = [
            ("ladder.max_move_pct", self.ladder.max_move_pct),
            ("ladder.total_amount", self.ladder.total_amount),
            ("ladder.min_order_amount", self.ladder.min_order_amount),
            ("exits.take_profit_pct", self.exits.take_profit_pct),
            ("exits.stop_loss_pct", self.exits.stop_loss_pct),
        ];
        for (name, value) in positives {
            if value <= Decimal::ZERO {
                return Err(AppError::Config(format!("{name} must be positive")));
            }
        }

        if let Some(trailing) = &self.exits.trailing {
            if trailing.distance_pct <= Decimal::ZERO {
                return Err(AppError::Config(
                    "exits.trailing.distance_pct must be positive".to_string(),
                ));
            }
            if trailing.activation_pct < Decimal::ZERO {
                return Err(AppError::Config(
                    "exits.trailing.activation_pct must not be negative".to_string(),
                ));
            }
        }

        if self.feed.stale_reconnect_threshold_ms <= self.feed.stale_fetch_threshold_ms {
            return Err(AppError::Config(
                "feed.stale_reconnect_threshold_ms must exceed stale_fetch_threshold_ms"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Stream name for the single logical subscription.
    pub fn stream_name(&self) -> String {
        format!("{}@ticker", self.symbol.to_lowercase())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.endpoints.ws_url.clone(),
            stream: self.stream_name(),
            max_reconnect_attempts: self.websocket.max_reconnect_attempts,
            reconnect_base_delay_ms: self.websocket.reconnect_base_delay_ms,
            reconnect_backoff_factor: 1.5,
            reconnect_max_delay_ms: self.websocket.reconnect_max_delay_ms,
            heartbeat_interval_ms: self.websocket.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.websocket.heartbeat_timeout_ms,
            max_heartbeat_failures: self.websocket.max_heartbeat_failures,
            dedup: DedupConfig::default(),
            dedup_sweep_interval_ms: 30000,
        }
    }

    pub fn feed_config(&self) -> PriceFeedConfig {
        PriceFeedConfig {
            symbol: self.symbol.clone(),
            min_publish_interval_ms: self.feed.min_publish_interval_ms,
            stale_fetch_threshold_ms: self.feed.stale_fetch_threshold_ms,
            stale_reconnect_threshold_ms: self.feed.stale_reconnect_threshold_ms,
            staleness_check_interval_ms: self.feed.staleness_check_interval_ms,
            rest_attempts: self.feed.rest_attempts,
            ..PriceFeedConfig::default()
        }
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            symbol: self.symbol.clone(),
            side: self.side,
            ladder: LadderConfig {
                max_move_pct: self.ladder.max_move_pct,
                total_amount: self.ladder.total_amount,
                rung_count: self.ladder.rung_count,
                increment_pct: self.ladder.increment_pct,
                min_order_amount: self.ladder.min_order_amount,
                price_tick: self.ladder.price_tick,
                qty_step: self.ladder.qty_step,
            },
            exits: ExitConfig {
                take_profit_pct: self.exits.take_profit_pct,
                stop_loss_pct: self.exits.stop_loss_pct,
                trailing: self.exits.trailing.as_ref().map(|t| TrailingConfig {
                    activation_pct: t.activation_pct,
                    distance_pct: t.distance_pct,
                }),
            },
            poll_interval_ms: self.cycle.poll_interval_ms,
            no_fill_timeout_ms: self.cycle.no_fill_timeout_ms,
            order_spacing_ms: self.cycle.order_spacing_ms,
            settle_delay_ms: self.cycle.settle_delay_ms,
            max_price_age_ms: self.cycle.max_price_age_ms,
            query_attempts: self.cycle.query_attempts,
            retry_base_delay_ms: self.cycle.retry_base_delay_ms,
            keep_existing_orders: self.cycle.keep_existing_orders,
            auto_restart: self.cycle.auto_restart,
            flatten_on_stop: self.cycle.flatten_on_stop,
            stop_grace_ms: self.cycle.stop_grace_ms,
        }
    }

    pub fn rest_config(&self, api_key: &str) -> RestClientConfig {
        RestClientConfig {
            base_url: self.endpoints.rest_url.clone(),
            api_key: api_key.to_string(),
            recv_window_ms: self.endpoints.recv_window_ms,
            timeout_ms: self.endpoints.timeout_ms,
        }
    }

    pub fn fallback_rest_config(&self, api_key: &str) -> Option<RestClientConfig> {
        self.endpoints.fallback_rest_url.as_ref().map(|url| RestClientConfig {
            base_url: url.clone(),
            api_key: api_key.to_string(),
            recv_window_ms: self.endpoints.recv_window_ms,
            timeout_ms: self.endpoints.timeout_ms,
        })
    }

    /// Shutdown grace period.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.cycle.stop_grace_ms)
    }
}
