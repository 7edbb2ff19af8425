//! Token-bucket admission control.
//!
//! Buckets refill lazily on access (no background timers), which keeps
//! behavior deterministic and independent of scheduler jitter. A
//! [`KeyedLimiter`] maps string keys to independent buckets; the router uses
//! one for per-caller limits, while each provider entry owns its bucket
//! directly.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::core::config::RateLimitConfig;
use crate::core::error::AppError;

/// A single token bucket.
///
/// Invariant: `0 <= tokens <= capacity` after every operation.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: refill_per_sec.max(f64::MIN_POSITIVE),
            last_refill: now,
        }
    }

    /// Build a bucket from configuration. `burst_size` is the capacity and
    /// `requests_per_minute` sets the long-run refill rate.
    pub fn from_config(config: &RateLimitConfig, now: Instant) -> Self {
        Self::new(
            config.burst_size,
            f64::from(config.requests_per_minute) / 60.0,
            now,
        )
    }

    /// Credit tokens for the time elapsed since the last refill, capped at
    /// capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to admit one request at the given instant.
    ///
    /// On rejection, returns the estimated seconds until a token becomes
    /// available: `(1 - tokens) / refill_rate`.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), f64> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    /// Try to admit one request now.
    pub fn try_acquire(&mut self) -> Result<(), f64> {
        self.try_acquire_at(Instant::now())
    }

    /// Current token count, without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Rate limiter managing independent buckets keyed by string.
///
/// Keys without a registered bucket are not limited; a caller exhausting its
/// own bucket never affects other keys.
pub struct KeyedLimiter {
    buckets: DashMap<String, Mutex<TokenBucket>>,
}

impl KeyedLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Register (or replace) the bucket for a key.
    pub fn register(&self, key: &str, config: &RateLimitConfig) {
        self.buckets.insert(
            key.to_string(),
            Mutex::new(TokenBucket::from_config(config, Instant::now())),
        );
    }

    /// Check admission for a key.
    ///
    /// Returns `Err(AppError::RateLimitExceeded)` with a retry-after estimate
    /// when the bucket is empty; unregistered keys are always admitted.
    pub fn check(&self, key: &str) -> Result<(), AppError> {
        let Some(bucket) = self.buckets.get(key) else {
            return Ok(());
        };
        let mut bucket = bucket.lock().expect("bucket mutex poisoned");
        match bucket.try_acquire() {
            Ok(()) => Ok(()),
            Err(retry_after_secs) => {
                tracing::warn!(key = %key, retry_after_secs, "Rate limit exceeded");
                Err(AppError::RateLimitExceeded { retry_after_secs })
            }
        }
    }

    /// Remove the bucket for a key.
    pub fn remove(&self, key: &str) {
        self.buckets.remove(key);
    }

    /// Replace registrations with the given set, dropping stale keys.
    pub fn sync<'a, I>(&self, desired: I)
    where
        I: IntoIterator<Item = (&'a str, &'a RateLimitConfig)>,
    {
        let mut keep = std::collections::HashSet::new();
        for (key, config) in desired {
            keep.insert(key.to_string());
            self.register(key, config);
        }
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| !keep.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.buckets.remove(key);
        }
        if !stale.is_empty() {
            tracing::info!(removed_count = stale.len(), "Removed stale rate limit buckets");
        }
    }
}

impl Default for KeyedLimiter {
    fn default() -> Self {
        Self::new()
    }
}
