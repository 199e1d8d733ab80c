//! Core domain types for the ladder trading bot.
//!
//! This crate provides the fundamental types used throughout the system:
//! - `Price`, `Size`: precision-safe numeric types
//! - `OrderSide`, `PositionSide`, `OrderType`: trading enums
//! - `PriceUpdate`, `PriceSource`: canonical market-data events
//! - `Position`: polled exchange position snapshot
//! - `ClientOrderId`: idempotency keys for order submission

pub mod decimal;
pub mod order;
pub mod types;

pub use decimal::{Price, Size};
pub use order::{ClientOrderId, OrderSide, OrderStatus, OrderType, PositionSide};
pub use types::{Position, PriceSource, PriceUpdate};
