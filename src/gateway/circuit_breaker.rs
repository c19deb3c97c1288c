//! Circuit breaker guarding gateway reconnection attempts.
//!
//! Consecutive connection failures trip the circuit, after which no
//! attempt is made until the cool-down elapses. The first attempt after
//! the cool-down is a single half-open probe: success restores the
//! circuit, failure re-trips it for another full cool-down.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  N failures   ┌────────┐  cooldown   ┌──────────┐
//! │ Closed ├──────────────►│  Open  ├────────────►│ HalfOpen │
//! └───▲────┘               └────────┘             └────┬─────┘
//!     │                         ▲                      │
//!     │  success                │  failure              │
//!     └─────────────────────────┴──────────────────────┘
//! ```
//!
//! Every time-dependent method takes `now` explicitly so the policy can be
//! driven deterministically in tests.

use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Healthy: attempts are allowed.
    Closed,
    /// Tripped: attempts are blocked until `reopen_at`.
    Open { reopen_at: Instant },
    /// Cool-down elapsed: one probe attempt is allowed.
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    probe_taken: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_taken: false,
        }
    }

    /// Record a successful connection. Closes the circuit from any state.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.probe_taken = false;
    }

    /// Record a failed attempt at `now`.
    ///
    /// Trips the circuit when the threshold is reached, and re-trips it
    /// immediately when the failed attempt was the half-open probe.
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trip = matches!(self.state, CircuitState::HalfOpen)
            || self.consecutive_failures >= self.failure_threshold;
        if trip {
            self.state = CircuitState::Open {
                reopen_at: now + self.cooldown,
            };
            self.probe_taken = false;
        }
    }

    /// Whether an attempt may be made at `now`.
    ///
    /// - `Closed`: always.
    /// - `Open`: only once the cool-down has elapsed, which moves to `HalfOpen`
    ///   and hands out the probe.
    /// - `HalfOpen`: only if the probe has not been handed out yet.
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { reopen_at } => {
                if now >= reopen_at {
                    self.state = CircuitState::HalfOpen;
                    self.probe_taken = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_taken {
                    false
                } else {
                    self.probe_taken = true;
                    true
                }
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the open circuit admits its probe, if it is open.
    pub fn reopen_at(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open { reopen_at } => Some(reopen_at),
            _ => None,
        }
    }
}
