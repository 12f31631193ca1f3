//! Reconnection retry policy: bounded attempts, capped exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transport reconnection.
///
/// Delay for attempt `n` (1-based) is
/// `initial_delay_ms * multiplier^(n-1)`, capped at `max_delay_ms`, with up
/// to `jitter` fractional randomization on top to avoid thundering herds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum consecutive attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Fractional jitter in `[0.0, 1.0]`; `0.1` means up to +10%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Deterministic (jitter-free) delay for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for a 1-based attempt number, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::random::<f64>() * self.jitter;
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
