//! Bounded-retry wrapper for remote calls.
//!
//! Runs an operation up to `max_attempts` times with exponential backoff
//! between attempts; the last error propagates unchanged. Every REST call
//! in the system goes through this, as does the feed's REST fallback.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Generic bounded-retry executor.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    /// Delay before the first retry.
    base_delay: Duration,
    /// Cap on the backoff delay.
    max_delay: Duration,
}

impl RetryExecutor {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Run `operation` with up to `max_attempts` tries.
    ///
    /// Backoff before retry `n` (0-based) is `base_delay * 2^n`, capped.
    /// No retry happens after the final attempt.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F, max_attempts: u32) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(e);
                    }

                    let delay = self.backoff_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_delay(&self, retry_index: u32) -> Duration {
        let factor = 1u64 << retry_index.min(16);
        let delay = self.base_delay.saturating_mul(factor as u32);
        delay.min(self.max_delay)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(10))
    }
}
