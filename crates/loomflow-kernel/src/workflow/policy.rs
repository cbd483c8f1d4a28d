//! Resilience policy records
//!
//! Plain serde records describing how wrappers behave. The wrappers
//! themselves live in `loomflow-foundation`; these types are shared with
//! configuration so a policy can be declared in a file.
//!
//! ```text
//! Closed ──(threshold consecutive failures)──▶ Open ──(cooldown)──▶ HalfOpen
//!    ▲                                          ▲                      │
//!    └──────────── probe success ───────────────┼──── probe failure ───┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// RetryPolicy
// ============================================================================

/// Retry schedule.
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `max_retries` | `3` | Additional attempts after the first |
/// | `base_delay_ms` | `100` | Base delay between attempts |
/// | `exponential` | `true` | `base * 2^attempt` instead of constant |
/// | `jitter` | `false` | Randomize each delay by up to ±50% |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub exponential: bool,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            exponential: true,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            ..Self::default()
        }
    }

    pub fn constant(mut self) -> Self {
        self.exponential = false;
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Un-jittered delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return Duration::from_millis(self.base_delay_ms);
        }
        let shift = attempt.min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << shift))
    }
}

// ============================================================================
// TimeoutPolicy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub duration_ms: u64,
}

impl TimeoutPolicy {
    pub fn new(duration_ms: u64) -> Self {
        Self { duration_ms }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub cooldown_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            threshold,
            cooldown_ms,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected with `CircuitOpen`.
    Open,
    /// One probe call is admitted.
    HalfOpen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles() {
        let policy = RetryPolicy::new(3, 100);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn constant_delay_stays_flat() {
        let policy = RetryPolicy::new(3, 50).constant();
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(5));
    }

    #[test]
    fn large_attempts_do_not_overflow() {
        let policy = RetryPolicy::new(100, u64::MAX / 2);
        assert_eq!(policy.delay_for_attempt(60).as_millis(), u64::MAX as u128);
    }

    #[test]
    fn policies_deserialize_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_retries": 1}"#).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.base_delay_ms, 100);
        assert!(policy.exponential);

        let breaker: CircuitBreakerConfig =
            serde_json::from_str(r#"{"threshold": 3, "cooldown_ms": 1000}"#).unwrap();
        assert_eq!(breaker.cooldown(), Duration::from_secs(1));
    }
}
