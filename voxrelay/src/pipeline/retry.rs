use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with ±25% jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after `attempt` failed, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Delay before retrying after `attempt` failed. Never above
    /// `max_delay_ms`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay(attempt).as_millis() as u64;

        let jitter_range = delay_ms / 4;
        if jitter_range == 0 {
            return Duration::from_millis(delay_ms);
        }
        let offset = rand::random::<u64>() % (jitter_range * 2 + 1);
        Duration::from_millis((delay_ms - jitter_range + offset).min(self.max_delay_ms))
    }
}
