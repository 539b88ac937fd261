//! # opguard
//!
//! Resilient operation layer for clients of an unreliable, rate-limited,
//! partially-available backend: a persistent sliding-window rate limiter,
//! pluggable backoff strategies, per-dependency circuit breakers, a retry
//! orchestrator, and a durable offline operation queue.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opguard::{ActionKind, ResilienceLayer, RetryOutcome, RetryPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), opguard::Error> {
//!     let layer = ResilienceLayer::builder().build().await?;
//!
//!     let outcome: RetryOutcome<(), std::io::Error> = layer
//!         .run(
//!             ActionKind::Message,
//!             "send-chat-message:convo-7",
//!             "chat-backend",
//!             &RetryPolicy::default(),
//!             &opguard::DefaultClassifier,
//!             || Box::pin(async { Ok(()) }),
//!         )
//!         .await?;
//!
//!     if let RetryOutcome::Success { attempts, .. } = outcome {
//!         println!("delivered after {attempts} attempt(s)");
//!     }
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod layer;
pub mod limiter;
pub mod queue;
pub mod retry;
pub mod storage;

// Re-exports for convenience
pub use backoff::{BackoffSchedule, BackoffStrategy};
pub use breaker::{
    BreakerError, BreakerRegistry, CircuitBreaker, CircuitConfig, CircuitOpenError, CircuitState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use layer::{ResilienceLayer, ResilienceLayerBuilder};
pub use limiter::{ActionKind, RateLimitConfig, RateLimiter, WindowLimit};
pub use queue::{
    DeliveryError, DeliveryHandler, DrainReport, OfflineQueue, OperationStatus, PendingOperation,
    QueueConfig, QueueEvent,
};
pub use retry::{
    AttemptProgress, DefaultClassifier, ErrorClass, ErrorClassifier, InFlightRegistry,
    OperationPermit, Orchestrator, RetryOutcome, RetryPolicy,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};

/// Error type for opguard operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Local admission denied: the action's window is at its ceiling.
    #[error("rate limit exceeded for {action}{}", match retry_after {
        Some(d) => format!(", retry in {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    RateLimited {
        action: limiter::ActionKind,
        retry_after: Option<std::time::Duration>,
    },

    /// The dependency's breaker is open; the operation was not attempted.
    #[error("circuit open, retry after {reset_at}")]
    CircuitOpen {
        reset_at: chrono::DateTime<chrono::Utc>,
    },

    /// An identical logical operation is already in flight.
    #[error("duplicate operation already in flight: {key}")]
    DuplicateInFlight { key: String },

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Suggested wait before trying again, where one is known.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

impl From<breaker::CircuitOpenError> for Error {
    fn from(err: breaker::CircuitOpenError) -> Self {
        Error::CircuitOpen {
            reset_at: err.reset_at,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
