//! Retry utilities for outbound requests.
//!
//! Provides a retry policy with exponential backoff and optional jitter,
//! and a helper that drives an attempt closure until it succeeds, fails
//! with a non-retryable error, or runs out of attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether this error should trigger another attempt.
    fn is_retryable(&self) -> bool;
}

/// Retry policy consumed by the request engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. `2` means up to three sends.
    pub retries: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: u32,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) applied to delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(300),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Default policy with a different retry count.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// The same policy limited to a single attempt.
    pub fn single_attempt(&self) -> Self {
        Self {
            retries: 0,
            ..self.clone()
        }
    }

    /// Total sends allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait after a failed `attempt` (1-based).
    ///
    /// `base * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = self.multiplier.max(1).saturating_pow(attempt - 1);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter > 0.0 && !delay.is_zero() {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            return delay.mul_f64((1.0 + jitter).max(0.0));
        }
        delay
    }
}

/// Run an async operation with retries on retryable errors.
///
/// `op` receives the 1-based attempt number. When attempts run out the
/// last error is returned unchanged.
pub async fn run_with_retry<F, Fut, T, E>(label: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        debug!(label, attempt, max_attempts, "Starting attempt");

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying after backoff"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(label, attempt, error = %err, "Giving up");
                return Err(err);
            }
        }
    }
}
