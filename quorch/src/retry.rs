use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and backoff policy for the model-creation job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u16,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            // one retry after the first failure
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Delay before attempt number `attempt` (1-based).
    ///
    /// Formula: `min(base_delay * 2^(attempt - 2), max_backoff)`, zero for
    /// the first attempt.
    pub fn delay_before(&self, attempt: u16) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = i32::from(attempt - 2);
        let scaled = (self.base_delay_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Whether `attempts` failed attempts exhaust the policy.
    pub fn is_exhausted(&self, attempts: u16) -> bool {
        attempts >= self.max_attempts.max(1)
    }
}
