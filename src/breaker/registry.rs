//! Process-wide registry of breakers keyed by dependency name.

use std::sync::Arc;

use dashmap::DashMap;

use super::{CircuitBreaker, CircuitConfig};
use crate::clock::Clock;

/// Lazily creates one breaker per dependency name. Explicitly constructed
/// and passed by handle; never an ambient global.
pub struct BreakerRegistry {
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `dependency`, created with `config` on first use.
    /// The config only applies at creation; later callers share the
    /// existing instance.
    pub fn breaker(&self, dependency: &str, config: &CircuitConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    dependency,
                    config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// Existing breaker for `dependency`, if one was ever created.
    pub fn get(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).map(|b| Arc::clone(b.value()))
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
