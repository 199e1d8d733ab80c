//! Feed error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Payload carries no resolvable price")]
    MissingPrice,

    #[error("Non-positive price rejected: {0}")]
    NonPositivePrice(String),

    #[error("Payload symbol {got} does not match {expected}")]
    SymbolMismatch { got: String, expected: String },
}

pub type FeedResult<T> = Result<T, FeedError>;
