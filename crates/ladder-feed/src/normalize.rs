//! Ticker payload normalization.
//!
//! Venues disagree on ticker shapes; this module maps every shape the
//! stream is known to produce onto a single price observation:
//! - direct `price`
//! - ticker close (`c` / `close`)
//! - `last`, falling back to the bid/ask mid
//! - any of the above nested under `data`
//!
//! Unresolvable payloads are rejected with a typed error; the feed logs
//! them at a sampled rate and drops them.

use crate::error::{FeedError, FeedResult};
use ladder_core::Price;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// A successfully normalized price observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTick {
    pub price: Price,
}

/// Normalizes heterogeneous ticker payloads for one symbol.
#[derive(Debug)]
pub struct Normalizer {
    symbol: String,
}

impl Normalizer {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }

    /// Normalize a raw payload into a price observation.
    pub fn normalize(&self, payload: &Value) -> FeedResult<NormalizedTick> {
        let body = payload.get("data").unwrap_or(payload);

        // A payload naming a different symbol is someone else's data.
        if let Some(got) = string_field(body, &["s", "symbol"]) {
            if !got.eq_ignore_ascii_case(&self.symbol) {
                return Err(FeedError::SymbolMismatch {
                    got,
                    expected: self.symbol.clone(),
                });
            }
        }

        let price = resolve_price(body).ok_or(FeedError::MissingPrice)?;
        if !price.is_positive() {
            return Err(FeedError::NonPositivePrice(price.to_string()));
        }

        Ok(NormalizedTick { price })
    }
}

fn resolve_price(body: &Value) -> Option<Price> {
    for field in ["price", "c", "close", "last"] {
        if let Some(price) = body.get(field).and_then(decimal_value) {
            return Some(Price::new(price));
        }
    }

    // Bid/ask mid as the last resort.
    let bid = first_decimal(body, &["b", "bid"])?;
    let ask = first_decimal(body, &["a", "ask"])?;
    Some(Price::new((bid + ask) / Decimal::TWO))
}

fn first_decimal(body: &Value, names: &[&str]) -> Option<Decimal> {
    names.iter().find_map(|n| body.get(*n).and_then(decimal_value))
}

fn string_field(body: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| body.get(*n).and_then(Value::as_str))
        .map(str::to_string)
}

/// Decimal from a JSON string or number; venues use both.
fn decimal_value(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
