//! Bounded retry with exponential backoff and jitter.
//!
//! The policy only computes delays; the retry loop itself lives in the
//! router, where attempts interleave with circuit-breaker checks. Jitter
//! desynchronizes retry storms across concurrent callers.

use rand::Rng;
use std::time::Duration;

use crate::core::config::RetryConfig;

/// Retry policy parameters for one provider.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 0.999),
        }
    }

    /// Total attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before retrying after attempt `k` (0-indexed), without jitter:
    /// `min(max_delay, base_delay * multiplier^k)`.
    fn raw_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Backoff before retrying after attempt `k`, scaled by `(1 ± jitter)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter == 0.0 {
            return raw;
        }
        let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64(raw.as_secs_f64() * scale)
    }

    /// Upper bound on any delay this policy can produce, jitter included.
    pub fn max_possible_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay.as_secs_f64() * (1.0 + self.jitter))
    }
}
