//! Retry policy with capped exponential backoff and jitter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest fraction of the base delay added as random jitter.
pub const MAX_JITTER_FRACTION: f64 = 0.10;

/// Per-provider retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per provider, including the first
    pub max_attempts: u32,

    #[serde(with = "crate::config::humantime_duration")]
    pub base_delay: Duration,

    #[serde(with = "crate::config::humantime_duration")]
    pub max_delay: Duration,

    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// `min(base * 2^(attempt-1), cap)` for a 1-indexed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|m| self.base_delay.checked_mul(m))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before retrying after `attempt` failed.
    ///
    /// A server-provided `retry_after` replaces the computed backoff but is
    /// still capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let base = self.backoff(attempt);
        if self.jitter {
            base + base.mul_f64(rand::random::<f64>() * MAX_JITTER_FRACTION)
        } else {
            base
        }
    }
}
