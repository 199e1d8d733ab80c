//! Classified exchange error taxonomy.
//!
//! Each REST failure class carries a distinct recovery policy in the
//! cycle controller: rate limits skip a rung, insufficient funds aborts
//! the remaining batch, auth errors halt trading.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Response parse error: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Classify an HTTP failure by status and the venue's error body.
    ///
    /// Venues report insufficient margin with a body code rather than a
    /// dedicated status, so the code is checked first.
    pub fn classify(status: u16, code: i64, message: String) -> Self {
        if is_insufficient_funds_code(code) {
            return Self::InsufficientFunds(message);
        }
        match status {
            401 | 403 => Self::Auth(message),
            404 => Self::NotFound(message),
            418 | 429 => Self::RateLimited(message),
            _ => Self::Api { code, message },
        }
    }

    /// Check whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_))
    }
}

/// Margin-related error codes observed across venues.
fn is_insufficient_funds_code(code: i64) -> bool {
    matches!(code, -2019 | -2018 | -4164)
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
