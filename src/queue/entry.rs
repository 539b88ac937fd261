//! Queue entry state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a pending operation.
///
/// Happy path: `AwaitingValidation -> Validated -> Sent`. Validation that
/// keeps failing ends at `ValidationFailed`; sends that keep failing end at
/// `Failed`. Any state can be dropped once the entry exceeds its max age.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    AwaitingValidation,
    ValidationFailed,
    Validated,
    Sent,
    Failed,
}

impl OperationStatus {
    /// Terminal states are never attempted again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::ValidationFailed | OperationStatus::Sent | OperationStatus::Failed
        )
    }
}

/// A durably queued operation awaiting eventual delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingOperation<P> {
    pub id: Uuid,
    pub payload: P,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub failure_reason: Option<String>,
}

impl<P> PendingOperation<P> {
    pub fn new(payload: P, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            status: OperationStatus::AwaitingValidation,
            created_at: now,
            last_attempt: None,
            attempts: 0,
            failure_reason: None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.created_at
    }

    pub(super) fn record_attempt(&mut self, now: DateTime<Utc>, reason: Option<String>) {
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.failure_reason = reason;
    }
}
