//! Composition root for the resilient operation layer.
//!
//! Holds explicitly constructed, dependency-injected instances of the rate
//! limiter, breaker registry, orchestrator, and in-flight registry, and
//! drives the admission pipeline: rate limit first (fast, fail-fast), then
//! duplicate suppression, then orchestrated execution. Never an ambient
//! global; tests construct isolated layers with injected clocks and stores.

use std::sync::Arc;

use crate::breaker::BreakerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::limiter::{ActionKind, RateLimitConfig, RateLimiter};
use crate::retry::{
    ErrorClassifier, InFlightRegistry, Operation, Orchestrator, RetryOutcome, RetryPolicy,
};
use crate::storage::{KeyValueStore, MemoryStore};

pub struct ResilienceLayer {
    limiter: Arc<RateLimiter>,
    orchestrator: Arc<Orchestrator>,
    in_flight: InFlightRegistry,
}

impl ResilienceLayer {
    pub fn builder() -> ResilienceLayerBuilder {
        ResilienceLayerBuilder::default()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.orchestrator.breakers()
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// Full admission pipeline for one operation.
    ///
    /// Denials happen before the operation runs: a rate-limit denial or a
    /// duplicate in-flight key fails fast without consuming retry budget.
    /// Message sends are admitted against both the per-minute burst window
    /// and the per-day global cap in one atomic check; the denial error
    /// names whichever window refused. `operation_key` names the logical
    /// operation (same action + same target), so a concurrent duplicate is
    /// rejected rather than run twice.
    pub async fn run<T, E, F, C>(
        &self,
        action: ActionKind,
        operation_key: &str,
        dependency: &str,
        policy: &RetryPolicy,
        classifier: &C,
        operation: F,
    ) -> crate::Result<RetryOutcome<T, E>>
    where
        F: FnMut() -> Operation<T, E>,
        C: ErrorClassifier<E>,
    {
        match action {
            ActionKind::Message => {
                self.limiter
                    .admit_many(&[ActionKind::Message, ActionKind::DailyMessageCap])
                    .await?
            }
            _ => self.limiter.admit(action).await?,
        }

        let _permit = self
            .in_flight
            .try_acquire(operation_key)
            .ok_or_else(|| crate::Error::DuplicateInFlight {
                key: operation_key.to_string(),
            })?;

        Ok(self
            .orchestrator
            .execute(operation_key, dependency, policy, classifier, operation)
            .await)
    }
}

pub struct ResilienceLayerBuilder {
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    limits: RateLimitConfig,
}

impl Default for ResilienceLayerBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            store: Arc::new(MemoryStore::new()),
            limits: RateLimitConfig::default(),
        }
    }
}

impl ResilienceLayerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn limits(mut self, limits: RateLimitConfig) -> Self {
        self.limits = limits;
        self
    }

    pub async fn build(self) -> crate::Result<ResilienceLayer> {
        let limiter = RateLimiter::load(self.limits, self.clock.clone(), self.store).await?;
        let breakers = Arc::new(BreakerRegistry::new(self.clock));

        Ok(ResilienceLayer {
            limiter: Arc::new(limiter),
            orchestrator: Arc::new(Orchestrator::new(breakers)),
            in_flight: InFlightRegistry::new(),
        })
    }
}
