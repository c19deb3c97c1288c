//! Reconnection policy: exponential backoff in front of a circuit breaker.

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::ReconnectConfig;
use std::time::{Duration, Instant};

/// Delay before retry number `attempt` (1-indexed): `base · 2^(attempt−1)`, capped at `max`.
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make retry number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Circuit tripped: make no attempt before `until`.
    CircuitOpen { until: Instant },
}

/// Combines backoff delays with the circuit breaker.
#[derive(Debug)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    breaker: CircuitBreaker,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.cooldown_secs),
            ),
        }
    }

    /// A connection attempt failed at `now`.
    pub fn on_failure(&mut self, now: Instant) -> RetryDecision {
        self.breaker.record_failure(now);
        match self.breaker.reopen_at() {
            Some(until) => RetryDecision::CircuitOpen { until },
            None => {
                let attempt = self.breaker.consecutive_failures();
                RetryDecision::Retry {
                    attempt,
                    delay: backoff_delay(self.base, self.max, attempt),
                }
            }
        }
    }

    /// The handshake completed: reset the attempt counter and close the circuit.
    pub fn on_connected(&mut self) {
        self.breaker.record_success();
    }

    /// An established session dropped.
    ///
    /// The previous connection was healthy, so retries start over from a
    /// closed circuit and the first retry waits only the base delay.
    pub fn on_session_lost(&mut self) -> Duration {
        self.breaker.record_success();
        self.base
    }

    /// Whether an attempt may be made at `now` (consumes the half-open probe).
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        self.breaker.should_attempt(now)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn attempts(&self) -> u32 {
        self.breaker.consecutive_failures()
    }
}
