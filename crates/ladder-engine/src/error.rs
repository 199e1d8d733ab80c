//! Engine error types.

use ladder_exchange::ExchangeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Trading halted: {0}")]
    Halted(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
