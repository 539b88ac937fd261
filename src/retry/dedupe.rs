//! In-flight duplicate suppression.
//!
//! Two identical logical operations (same action, same target) must not run
//! concurrently: the first acquires a permit keyed by the operation, later
//! acquisitions are refused until the permit drops.

use std::sync::Arc;

use dashmap::DashSet;

/// Tracks live operation keys.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    keys: Arc<DashSet<String>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `None` if an identical operation is already in
    /// flight. The claim is released when the permit drops, including on
    /// cancellation.
    pub fn try_acquire(&self, key: &str) -> Option<OperationPermit> {
        if self.keys.insert(key.to_string()) {
            Some(OperationPermit {
                keys: self.keys.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// RAII claim on an operation key.
pub struct OperationPermit {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl OperationPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
