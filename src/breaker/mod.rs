//! Per-dependency circuit breaker.
//!
//! Classic three-state machine: closed passes calls through and counts
//! consecutive failures; open rejects without invoking the operation until
//! the scheduled reset; half-open lets exactly one trial call through.
//! Breaker state is advisory and in-memory only; a restart starts closed.

mod registry;

pub use registry::BreakerRegistry;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clock::{Clock, chrono_duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Rejection from an open breaker. The wrapped operation was never invoked.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("circuit open, retry after {reset_at}")]
pub struct CircuitOpenError {
    pub reset_at: DateTime<Utc>,
}

/// Outcome of [`CircuitBreaker::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker refused the call outright.
    Open(CircuitOpenError),
    /// The call ran and failed; the failure was recorded.
    Operation(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open(e) => e.fmt(f),
            BreakerError::Operation(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open(e) => Some(e),
            BreakerError::Operation(e) => Some(e),
        }
    }
}

/// Trip threshold and cooldown schedule for one breaker.
#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Base cooldown after a trip.
    pub cooldown: Duration,
    /// Cooldown multiplier per repeated trip cycle. `1.0` keeps the cooldown
    /// constant; larger values back off harder on each re-trip.
    pub cooldown_growth: f64,
    /// Ceiling on the grown cooldown.
    pub max_cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_growth: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitConfig {
    /// Trips early but recovers fast, with a constant cooldown.
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(15),
            cooldown_growth: 1.0,
            max_cooldown: Duration::from_secs(15),
        }
    }

    /// Tolerates more failures, then backs off hard on repeated trips.
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 8,
            cooldown: Duration::from_secs(60),
            cooldown_growth: 2.0,
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    trip_count: u32,
    last_failure: Option<DateTime<Utc>>,
    reset_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    trial_started: Option<DateTime<Utc>>,
}

/// Breaker for a single downstream dependency.
///
/// All state lives behind one mutex: reads and transitions are serialized,
/// so two concurrent acquires cannot both claim the half-open trial slot.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trip_count: 0,
                last_failure: None,
                reset_at: None,
                trial_in_flight: false,
                trial_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Scheduled reset time while open.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.lock().reset_at
    }

    /// Ask to place a call. `Ok` means the caller must follow up with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let reset_at = inner.reset_at.unwrap_or(now);
                if now >= reset_at {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.trial_started = Some(now);
                    info!(breaker = %self.name, "circuit breaker half-open");
                    Ok(())
                } else {
                    Err(CircuitOpenError { reset_at })
                }
            }
            CircuitState::HalfOpen => {
                let cooldown = chrono_duration(self.cooldown_for(inner.trip_count));
                match inner.trial_started {
                    Some(started) if inner.trial_in_flight && now - started < cooldown => {
                        Err(CircuitOpenError {
                            reset_at: started + cooldown,
                        })
                    }
                    _ => {
                        // No live trial, or its owner was cancelled and never
                        // reported back; re-arm the slot rather than refusing
                        // until process restart.
                        inner.trial_in_flight = true;
                        inner.trial_started = Some(now);
                        Ok(())
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.close(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                self.trip(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` through the breaker. When open, the operation is
    /// never invoked.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().map_err(BreakerError::Open)?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Force the breaker closed, discarding failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.close(&mut inner);
    }

    fn cooldown_for(&self, trips: u32) -> Duration {
        self.config
            .cooldown
            .mul_f64(self.config.cooldown_growth.powi(trips.max(1) as i32 - 1))
            .min(self.config.max_cooldown)
    }

    fn trip(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.trip_count += 1;
        let grown = self.cooldown_for(inner.trip_count);
        inner.state = CircuitState::Open;
        inner.reset_at = Some(now + chrono_duration(grown));
        inner.trial_in_flight = false;
        inner.trial_started = None;
        warn!(
            breaker = %self.name,
            trips = inner.trip_count,
            cooldown_secs = grown.as_secs_f64(),
            "circuit breaker opened"
        );
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trip_count = 0;
        inner.reset_at = None;
        inner.trial_in_flight = false;
        inner.trial_started = None;
        info!(breaker = %self.name, "circuit breaker closed");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
