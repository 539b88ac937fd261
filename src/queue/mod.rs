//! Durable offline operation queue.
//!
//! Holds operations that must eventually succeed (chat sends composed while
//! offline) and drains them whenever connectivity returns. Each entry carries
//! its own retry state, independent of the retry orchestrator, because it
//! must survive process restarts and network loss rather than one call's
//! lifetime. Per-attempt failures are never surfaced to the caller; only
//! final outcomes appear on the event stream.

mod entry;

pub use entry::{OperationStatus, PendingOperation};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffSchedule, BackoffStrategy};
use crate::clock::{Clock, chrono_duration};
use crate::storage::{KeyValueStore, StorageResult};

/// Validation/send attempts per entry before giving up.
pub const QUEUE_MAX_ATTEMPTS: u32 = 5;
/// Entries older than this are abandoned rather than delivered late.
pub const QUEUE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Base gap between attempts on one entry.
pub const QUEUE_RETRY_BASE: Duration = Duration::from_secs(30);
/// Ceiling on the between-attempt gap.
pub const QUEUE_RETRY_CAP: Duration = Duration::from_secs(5 * 60);

const STORAGE_KEY: &str = "offline-queue";

/// Retry budget and timing for queued entries.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub max_age: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: QUEUE_MAX_ATTEMPTS,
            max_age: QUEUE_MAX_AGE,
            retry_base: QUEUE_RETRY_BASE,
            retry_cap: QUEUE_RETRY_CAP,
        }
    }
}

impl QueueConfig {
    /// Exponential-with-cap gap schedule, independent of any retry policy.
    fn gap_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::new(BackoffStrategy::Exponential, self.retry_base, self.retry_cap)
    }
}

/// Final outcome of a queued operation, published to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEvent {
    Delivered { id: Uuid },
    Expired { id: Uuid },
    ValidationFailed { id: Uuid },
    SendFailed { id: Uuid },
}

/// Collaborator failure during a drain attempt. Recorded on the entry,
/// never surfaced to the original caller.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DeliveryError(pub String);

/// External collaborators the queue drains through: a boolean-returning
/// content check and the actual delivery call.
#[async_trait::async_trait]
pub trait DeliveryHandler<P>: Send + Sync {
    /// `Ok(false)` means the content was rejected; `Err` means the check
    /// itself could not complete. Both count against the attempt budget.
    async fn validate(&self, payload: &P) -> Result<bool, DeliveryError>;

    async fn send(&self, payload: &P) -> Result<(), DeliveryError>;
}

/// Counts from one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub expired: usize,
    pub validation_failed: usize,
    pub send_failed: usize,
    /// Entries skipped because their retry gap has not elapsed yet.
    pub deferred: usize,
    /// Non-terminal entries still queued after the pass.
    pub remaining: usize,
}

/// Durable queue of fire-and-forget operations.
///
/// The whole drain pass holds the entry list lock, so passes and enqueues
/// are serialized; entries are processed in creation order so messages go
/// out in the order the user composed them.
pub struct OfflineQueue<P> {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    entries: Mutex<Vec<PendingOperation<P>>>,
    events: broadcast::Sender<QueueEvent>,
}

impl<P> OfflineQueue<P>
where
    P: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Build a queue, reloading persisted entries.
    pub async fn load(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
    ) -> StorageResult<Self> {
        let mut entries: Vec<PendingOperation<P>> = match store.load(STORAGE_KEY).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "discarding unreadable offline queue");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        // Entries that aged out while the process was down are not revived.
        let now = clock.now();
        let max_age = chrono_duration(config.max_age);
        entries.retain(|entry| entry.age(now) <= max_age);
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config,
            clock,
            store,
            entries: Mutex::new(entries),
            events,
        })
    }

    /// Durably enqueue a payload for eventual delivery.
    pub async fn enqueue(&self, payload: P) -> StorageResult<Uuid> {
        let entry = PendingOperation::new(payload, self.clock.now());
        let id = entry.id;

        let mut entries = self.entries.lock().await;
        entries.push(entry);
        self.persist(&entries).await?;
        debug!(%id, total = entries.len(), "queued offline operation");
        Ok(id)
    }

    /// Subscribe to final outcomes (delivered / expired / failed).
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Snapshot of queued entries, creation order. Entries past their
    /// maximum age are dropped (publishing their expiry) before the
    /// snapshot is taken, so reads never report an operation that can
    /// no longer be delivered.
    pub async fn pending(&self) -> Vec<PendingOperation<P>> {
        let mut entries = self.entries.lock().await;
        self.drop_expired(&mut entries);
        entries.clone()
    }

    pub async fn len(&self) -> usize {
        let mut entries = self.entries.lock().await;
        self.drop_expired(&mut entries);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        let mut entries = self.entries.lock().await;
        self.drop_expired(&mut entries);
        entries.is_empty()
    }

    /// One drain pass; run on every connectivity-restored event.
    ///
    /// Expiry is checked first regardless of status, then eligible entries
    /// are validated and sent in creation order.
    pub async fn drain<H>(&self, handler: &H) -> StorageResult<DrainReport>
    where
        H: DeliveryHandler<P>,
    {
        let gap = self.config.gap_schedule();
        let mut report = DrainReport::default();
        let mut entries = self.entries.lock().await;
        report.expired = self.drop_expired(&mut entries);
        let mut kept: Vec<PendingOperation<P>> = Vec::with_capacity(entries.len());

        for mut entry in entries.drain(..) {
            let now = self.clock.now();

            if entry.status.is_terminal() {
                // Kept until expiry so callers can observe the final status.
                kept.push(entry);
                continue;
            }

            if !self.attempt_due(&entry, now, &gap) {
                report.deferred += 1;
                kept.push(entry);
                continue;
            }

            if entry.status == OperationStatus::AwaitingValidation {
                match handler.validate(&entry.payload).await {
                    Ok(true) => {
                        entry.status = OperationStatus::Validated;
                        entry.failure_reason = None;
                    }
                    Ok(false) => {
                        entry.record_attempt(now, Some("content rejected".to_string()));
                        self.finish_if_exhausted(&mut entry, OperationStatus::ValidationFailed);
                        report.validation_failed +=
                            (entry.status == OperationStatus::ValidationFailed) as usize;
                        kept.push(entry);
                        continue;
                    }
                    Err(e) => {
                        entry.record_attempt(now, Some(e.to_string()));
                        self.finish_if_exhausted(&mut entry, OperationStatus::ValidationFailed);
                        report.validation_failed +=
                            (entry.status == OperationStatus::ValidationFailed) as usize;
                        kept.push(entry);
                        continue;
                    }
                }
            }

            match handler.send(&entry.payload).await {
                Ok(()) => {
                    report.delivered += 1;
                    self.emit(QueueEvent::Delivered { id: entry.id });
                    // Sent entries leave the durable queue.
                }
                Err(e) => {
                    let now = self.clock.now();
                    entry.record_attempt(now, Some(e.to_string()));
                    self.finish_if_exhausted(&mut entry, OperationStatus::Failed);
                    report.send_failed += (entry.status == OperationStatus::Failed) as usize;
                    kept.push(entry);
                }
            }
        }

        report.remaining = kept.iter().filter(|e| !e.status.is_terminal()).count();
        *entries = kept;
        self.persist(&entries).await?;
        Ok(report)
    }

    /// Gap gating: never attempted, or enough time since the last attempt.
    /// The required gap follows the exponential-with-cap schedule.
    fn attempt_due(
        &self,
        entry: &PendingOperation<P>,
        now: chrono::DateTime<chrono::Utc>,
        gap: &BackoffSchedule,
    ) -> bool {
        if entry.attempts >= self.config.max_attempts {
            return false;
        }
        match entry.last_attempt {
            None => true,
            Some(last) => {
                let required = gap.delay_with_unit(entry.attempts, 0.0);
                now - last >= chrono_duration(required)
            }
        }
    }

    fn finish_if_exhausted(&self, entry: &mut PendingOperation<P>, terminal: OperationStatus) {
        if entry.attempts >= self.config.max_attempts {
            warn!(
                id = %entry.id,
                attempts = entry.attempts,
                reason = entry.failure_reason.as_deref().unwrap_or("unknown"),
                "queue entry exhausted its attempts"
            );
            entry.status = terminal;
            let event = match terminal {
                OperationStatus::ValidationFailed => QueueEvent::ValidationFailed { id: entry.id },
                _ => QueueEvent::SendFailed { id: entry.id },
            };
            self.emit(event);
        }
    }

    /// A message that has waited too long is abandoned, not delivered late
    /// and out of order. In-memory removal is immediate; durable removal
    /// happens on the next persist.
    fn drop_expired(&self, entries: &mut Vec<PendingOperation<P>>) -> usize {
        let now = self.clock.now();
        let max_age = chrono_duration(self.config.max_age);
        let before = entries.len();
        entries.retain(|entry| {
            if entry.age(now) > max_age {
                info!(id = %entry.id, status = ?entry.status, "dropping expired queue entry");
                self.emit(QueueEvent::Expired { id: entry.id });
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn persist(&self, entries: &[PendingOperation<P>]) -> StorageResult<()> {
        let bytes = serde_json::to_vec(entries)?;
        self.store.save(STORAGE_KEY, bytes).await
    }
}
