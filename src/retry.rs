//! Retry with exponential backoff.
//!
//! Provider calls that fail with [`ProviderError::Retryable`], or that exceed
//! their per-operation timeout, are retried according to a [`RetryPolicy`].
//! Every other error is returned immediately.

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff settings for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Factor applied to the delay after each retry.
    pub multiplier: f64,
    /// Overall time allowed for one call including all retries.
    #[serde(with = "millis", rename = "budget_ms")]
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            budget: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between attempts.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the overall time budget.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// The delay before retry number `retry` (0 is the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy gives up.
///
/// Each attempt is bounded by `timeout`; a timed-out attempt counts as a
/// retryable failure. `retry_on` decides which errors are worth another
/// attempt. The last error is returned when retries are exhausted.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    timeout: Duration,
    operation: &str,
    retry_on: P,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    P: Fn(&ProviderError) -> bool,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            },
            Ok(Err(err)) => err,
            Err(_) => ProviderError::Retryable(format!(
                "{} timed out after {:?}",
                operation, timeout
            )),
        };

        if !retry_on(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(operation, attempt, error = %err, "Giving up after max attempts");
            return Err(err);
        }

        let delay = policy.delay(attempt - 1);
        if started.elapsed() + delay > policy.budget {
            warn!(operation, attempt, error = %err, "Retry budget exhausted");
            return Err(err);
        }

        debug!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

/// The default retry predicate: only [`ProviderError::Retryable`].
pub fn is_transient(err: &ProviderError) -> bool {
    err.is_retryable()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
