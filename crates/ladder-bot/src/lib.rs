//! Laddered entry trading bot.
//!
//! Opens a martingale-style ladder of entry orders, tracks the position
//! to a profit or loss target, closes, and cycles indefinitely.

pub mod app;
pub mod config;
pub mod error;
pub mod logging;

pub use app::{App, RunningApp};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use logging::init_logging;
