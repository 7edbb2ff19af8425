//! Per-provider circuit breaker.
//!
//! # States
//! - `Closed`: normal operation, consecutive failures counted
//! - `Open`: provider assumed down, calls rejected without touching the network
//! - `HalfOpen`: one trial call permitted to probe recovery
//!
//! # State transitions
//! ```text
//! Closed   -> Open:     consecutive_failures reaches the configured threshold
//! Open     -> HalfOpen: cooldown elapsed since opening; the acquiring request
//!                       claims the single trial slot
//! HalfOpen -> Closed:   trial call succeeds, failure counter resets to zero
//! HalfOpen -> Open:     trial call fails, cooldown restarts
//! ```
//!
//! Only one trial call may be in flight in `HalfOpen`; concurrent requests
//! arriving while the trial is outstanding are rejected rather than each
//! probing the upstream. All transitions happen under one short-held mutex;
//! no I/O occurs while it is locked.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::config::CircuitBreakerConfig;

/// Circuit state, readable by the router on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the `circuit_state` gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Read-only view of a provider's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-provider failure-isolation state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Ask permission to attempt an upstream call at the given instant.
    ///
    /// In `Open`, permission is granted only once the cooldown has elapsed,
    /// which moves the breaker to `HalfOpen` and claims the single trial
    /// slot. The caller must follow every granted permit with exactly one of
    /// [`on_success_at`](Self::on_success_at),
    /// [`on_failure_at`](Self::on_failure_at) or
    /// [`on_abandoned`](Self::on_abandoned).
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|at| now.saturating_duration_since(at) >= self.cooldown)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Ask permission to attempt an upstream call now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Record a successful call: close the circuit and reset the counter.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_in_flight = false;
    }

    /// Record a failed call at the given instant.
    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                // Trial failed: reopen and restart the cooldown
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened; nothing to do
            }
        }
    }

    /// Record a failed call now.
    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    /// Release a permit without recording an outcome (client cancelled).
    pub fn on_abandoned(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.trial_in_flight = false;
    }

    /// Current state and failure count.
    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }
}
