//! Bounded exponential retry around outbound sends, rate-limit aware.
//!
//! A rate-limit error sleeps the platform-suggested wait when present,
//! otherwise `2^attempt` seconds. Any other retryable error sleeps
//! `min(max_wait, min_wait * 2^attempt)`, no jitter. Non-retryable errors
//! propagate immediately, and the last error is re-raised once the attempt
//! ceiling is reached.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::BridgeError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            min_wait,
            max_wait,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_secs(config.min_wait_seconds),
            Duration::from_secs(config.max_wait_seconds),
        )
    }

    /// Run `operation` until it succeeds, fails non-retryably, or exhausts
    /// `max_attempts`. Attempts are 1-indexed.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        error!(
                            "max retries exceeded attempt={} error={}",
                            attempt, err
                        );
                        return Err(err);
                    }
                    let wait = self.wait_for(&err, attempt);
                    warn!(
                        "retryable failure, backing off attempt={} wait_secs={} error={}",
                        attempt,
                        wait.as_secs_f64(),
                        err
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn wait_for(&self, err: &BridgeError, attempt: u32) -> Duration {
        if let BridgeError::RateLimited { .. } = err {
            err.retry_after()
                .unwrap_or_else(|| Duration::from_secs(2u64.saturating_pow(attempt)))
        } else {
            self.min_wait
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(self.max_wait)
        }
    }
}
