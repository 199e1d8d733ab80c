//! Market-data and position types.
//!
//! Contains the canonical `PriceUpdate` event produced by the price feed
//! and the untrusted `Position` snapshot polled from the exchange.

use crate::{PositionSide, Price, Size};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of a price observation.
///
/// The feed degrades through these sources in order when the stream
/// goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriceSource {
    /// Live streaming connection.
    Stream,
    /// Primary REST endpoint (staleness fallback).
    RestPrimary,
    /// Secondary REST endpoint (primary failed).
    RestFallback,
    /// Last known price (all remote sources failed).
    Cache,
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::RestPrimary => write!(f, "rest-primary"),
            Self::RestFallback => write!(f, "rest-fallback"),
            Self::Cache => write!(f, "cache"),
        }
    }
}

/// A canonical price observation for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Observed price. Always positive; the feed drops non-positive values.
    pub price: Price,
    /// Local time the observation was made.
    pub observed_at: DateTime<Utc>,
    /// Where this observation came from.
    pub source: PriceSource,
}

impl PriceUpdate {
    /// Create an update stamped with the current time.
    pub fn new(symbol: impl Into<String>, price: Price, source: PriceSource) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            observed_at: Utc::now(),
            source,
        }
    }

    /// Age of this observation in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.observed_at).num_milliseconds()
    }

    /// Check if the observation is younger than `max_age_ms`.
    pub fn is_fresh(&self, max_age_ms: i64) -> bool {
        self.age_ms() < max_age_ms
    }
}

/// Position snapshot polled from the exchange.
///
/// Untrusted data: never assumed fresh beyond `fetched_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Position direction.
    pub side: PositionSide,
    /// Absolute position quantity.
    pub quantity: Size,
    /// Average entry price.
    pub entry_price: Price,
    /// Unrealized PnL as reported by the exchange.
    pub unrealized_pnl: Decimal,
    /// When this snapshot was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl Position {
    pub fn new(side: PositionSide, quantity: Size, entry_price: Price, unrealized_pnl: Decimal) -> Self {
        Self {
            side,
            quantity,
            entry_price,
            unrealized_pnl,
            fetched_at: Utc::now(),
        }
    }

    /// Check if the position is effectively flat.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Signed profit percent at `current` price, per side.
    ///
    /// Long: `(current - entry) / entry * 100`; short flips the sign.
    /// Returns None if the entry price is zero.
    pub fn profit_pct(&self, current: Price) -> Option<Decimal> {
        let raw = current.pct_from(self.entry_price)?;
        Some(raw * Decimal::from(self.side.sign()))
    }

    /// Age of this snapshot in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.fetched_at).num_milliseconds()
    }
}
