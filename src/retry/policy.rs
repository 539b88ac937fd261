//! Retry policies: immutable data, no behavior beyond the delay schedule.

use std::time::Duration;

use crate::backoff::{BackoffSchedule, BackoffStrategy};
use crate::breaker::CircuitConfig;

/// How an operation is retried: attempt budget, delay schedule, and whether
/// a circuit breaker is consulted.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter fraction; `None` disables jitter entirely.
    pub jitter: Option<f64>,
    /// Breaker configuration for the target dependency; `None` skips the
    /// breaker and calls the operation directly.
    pub breaker: Option<CircuitConfig>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: Some(0.1),
            breaker: Some(CircuitConfig::default()),
        }
    }
}

impl RetryPolicy {
    /// Many fast attempts with short delays; for cheap idempotent calls.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: Some(0.2),
            breaker: Some(CircuitConfig::aggressive()),
        }
    }

    /// Few attempts with long delays; for expensive operations.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Adaptive,
            jitter: Some(0.1),
            breaker: Some(CircuitConfig::conservative()),
        }
    }

    /// Default schedule without breaker involvement.
    pub fn no_breaker() -> Self {
        Self {
            breaker: None,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = None;
        self
    }

    /// Concrete delay schedule for this policy.
    pub fn schedule(&self) -> BackoffSchedule {
        let schedule = BackoffSchedule::new(self.strategy, self.base_delay, self.max_delay);
        match self.jitter {
            Some(fraction) => schedule.with_jitter(fraction),
            None => schedule,
        }
    }
}
