//! Fixed-delay retry for adapter queries
//!
//! Every failed attempt runs the caller's `after_failure` hook (the adapters
//! reset their handle there), including the final one. The last attempt's
//! error is returned unchanged.

use conduit_core::{ConduitError, Result};
use std::future::Future;
use std::time::Duration;

/// Retry bound and delay between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `operation` until it succeeds or the attempts run out.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn run<T, Op, Fut, Hook>(&self, mut operation: Op, mut after_failure: Hook) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        Hook: FnMut(&ConduitError),
    {
        let mut attempt = 1u32;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "operation failed"
                    );
                    after_failure(&err);

                    if attempt >= self.max_attempts {
                        return Err(err);
                    }

                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, one second apart
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
