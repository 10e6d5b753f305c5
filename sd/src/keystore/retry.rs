//! Bounded retry with exponential backoff

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::StoreError;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Retry policy for store operations
///
/// One initial attempt plus up to `max_retries` retries. The delay before
/// retry `n` (1-based) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Backoff before the given retry (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Worst-case total time spent sleeping across all retries
    pub fn max_total_delay(&self) -> Duration {
        (1..=self.max_retries).fold(Duration::ZERO, |acc, retry| acc.saturating_add(self.backoff(retry)))
    }

    /// Run `op` under this policy
    ///
    /// Transient errors are retried until the budget is spent, then the last
    /// error is returned. Non-transient errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => {
                    debug!(op = op_name, error = %e, "RetryPolicy::run: non-transient error");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_retries => {
                    error!(
                        op = op_name,
                        attempts = attempt + 1,
                        error = %e,
                        "Store operation failed after retries"
                    );
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let backoff = self.backoff(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Store operation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
