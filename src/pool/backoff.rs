//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A configuration with no retries (fail fast).
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Base delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Delay before retry number `attempt`, with ±20% jitter, capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        // Spread retries so many clients do not reconnect in lockstep
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64).min(self.max_delay)
    }
}

/// Retries an async operation with exponential backoff.
///
/// Stops at the first success, at the first error `is_retryable` rejects,
/// or after `max_retries` retries.
pub async fn retry_with_backoff<T, E, F, Fut, P>(config: &RetryConfig, mut operation: F, is_retryable: P) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if attempt > config.max_retries || !is_retryable(&err) {
                    return Err(err);
                }

                let delay = config.delay(attempt);
                debug!(
                    attempt,
                    max = config.max_retries + 1,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                sleep(delay).await;
            }
        }
    }
}
