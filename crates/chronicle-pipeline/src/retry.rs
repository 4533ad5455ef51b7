use std::future::Future;
use std::time::Duration;

use chronicle_core::ChronicleError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Bounded exponential backoff applied to capability and storage calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (1-based), capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay_ms as f64);
        capped as u64
    }
}

/// Run `call`, retrying retryable failures with exponential backoff.
/// `Validation` and `NotFound` abort on the first failure.
///
/// # Errors
/// Returns the final error once attempts are exhausted or the failure is not
/// retryable.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, ChronicleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChronicleError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !err.retryable() {
                    return Err(err);
                }
                let delay = policy.delay_ms(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay,
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}
