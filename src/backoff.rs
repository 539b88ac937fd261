//! Backoff delay computation for retry scheduling.
//!
//! Pure math: (attempt, base) -> delay, with four interchangeable growth
//! strategies, optional jitter, a hard cap, and per-error-category scaling.
//! Jitter is the only source of non-determinism and can be supplied as an
//! explicit unit value, so every delay is reproducible under test.

use std::time::Duration;

use crate::retry::ErrorClass;

/// Multiplier applied to delays after a rate-limited response.
pub const RATE_LIMIT_DELAY_FACTOR: f64 = 2.0;
/// Multiplier applied to delays after a 5xx server error.
pub const SERVER_ERROR_DELAY_FACTOR: f64 = 1.5;

/// Growth curve for retry delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base * 2^(attempt-1)` — 1, 2, 4, 8, ...
    Exponential,
    /// `base * attempt` — 1, 2, 3, 4, ...
    Linear,
    /// `base * fib(attempt)` with fib(1) = fib(2) = 1 — 1, 1, 2, 3, 5, ...
    Fibonacci,
    /// Flat for attempts 1-2, `1.5^` growth for 3-4, `2^` growth beyond.
    /// Holds off aggression until failures persist.
    Adaptive,
}

impl BackoffStrategy {
    /// Raw (unjittered, uncapped) multiplier for the given attempt.
    fn multiplier(self, attempt: u32) -> f64 {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Exponential => 2f64.powi(attempt as i32 - 1),
            BackoffStrategy::Linear => attempt as f64,
            BackoffStrategy::Fibonacci => fibonacci(attempt) as f64,
            BackoffStrategy::Adaptive => match attempt {
                1 | 2 => 1.0,
                3 | 4 => 1.5f64.powi(attempt as i32 - 2),
                n => 2f64.powi(n as i32 - 4),
            },
        }
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

/// A concrete delay schedule: strategy plus base, cap, and jitter fraction.
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffSchedule {
    pub fn new(strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        Self {
            strategy,
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Enable jitter: delays are multiplied by `1 + uniform(-fraction, +fraction)`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the retry following `attempt`, drawing the jitter unit
    /// from the thread RNG.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_unit(attempt, rand::random::<f64>() * 2.0 - 1.0)
    }

    /// Deterministic variant: `unit` in [-1, 1] stands in for the random
    /// draw. `unit = 0.0` gives the jitter-free delay.
    pub fn delay_with_unit(&self, attempt: u32, unit: f64) -> Duration {
        let raw = self.base.as_secs_f64() * self.strategy.multiplier(attempt);
        let jittered = raw * (1.0 + unit.clamp(-1.0, 1.0) * self.jitter);
        let capped = jittered.min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Delay adjusted for the failure category: rate-limit and server-error
    /// responses are held off longer than generic transient failures. The
    /// scale is applied after the cap, so these delays may exceed `max`.
    pub fn delay_for_class(&self, attempt: u32, class: &ErrorClass) -> Duration {
        self.delay_for_class_with_unit(attempt, class, rand::random::<f64>() * 2.0 - 1.0)
    }

    pub fn delay_for_class_with_unit(
        &self,
        attempt: u32,
        class: &ErrorClass,
        unit: f64,
    ) -> Duration {
        let delay = self.delay_with_unit(attempt, unit);
        match class {
            ErrorClass::RateLimited { .. } => delay.mul_f64(RATE_LIMIT_DELAY_FACTOR),
            ErrorClass::ServerError => delay.mul_f64(SERVER_ERROR_DELAY_FACTOR),
            _ => delay,
        }
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}
