//! Retry orchestration.
//!
//! Executes a caller-supplied fallible operation, consulting the circuit
//! breaker for admission, the backoff schedule for delay, and an error
//! classifier for retry eligibility. In-flight attempt counts are published
//! per operation name so observers can render "retrying, attempt N/M".

mod classifier;
mod dedupe;
mod policy;

pub use classifier::{DefaultClassifier, ErrorClass, ErrorClassifier};
pub use dedupe::{InFlightRegistry, OperationPermit};
pub use policy::RetryPolicy;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::breaker::BreakerRegistry;

/// Boxed fallible operation the orchestrator can re-invoke per attempt.
pub type Operation<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Terminal result of an orchestrated execution.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on attempt `attempts`.
    Success { value: T, attempts: u32 },
    /// Retries exhausted or the failure was not retryable.
    Failure { error: E, attempts: u32 },
    /// The breaker refused admission; the operation was not attempted.
    CircuitOpen { reset_at: DateTime<Utc> },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryOutcome::Success { attempts, .. } | RetryOutcome::Failure { attempts, .. } => {
                Some(*attempts)
            }
            RetryOutcome::CircuitOpen { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Published progress for an in-flight operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptProgress {
    pub current: u32,
    pub max: u32,
}

/// Drives retry loops against the breaker registry.
pub struct Orchestrator {
    breakers: Arc<BreakerRegistry>,
    attempts: DashMap<String, AttemptProgress>,
}

impl Orchestrator {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            attempts: DashMap::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Current attempt progress for `operation_name`, while it is in flight.
    pub fn attempt_progress(&self, operation_name: &str) -> Option<AttemptProgress> {
        self.attempts.get(operation_name).map(|p| *p)
    }

    /// Run `operation` under `policy` against `dependency`.
    ///
    /// The delay waits suspend only the calling task; dropping the returned
    /// future mid-wait abandons the loop without touching breaker or limiter
    /// state (consumed attempt slots stay spent).
    pub async fn execute<T, E, F, C>(
        &self,
        operation_name: &str,
        dependency: &str,
        policy: &RetryPolicy,
        classifier: &C,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Operation<T, E>,
        C: ErrorClassifier<E>,
    {
        let schedule = policy.schedule();
        let breaker = policy
            .breaker
            .as_ref()
            .map(|config| self.breakers.breaker(dependency, config));
        let max_attempts = policy.max_attempts.max(1);

        // Removes the published count on every exit path, cancellation
        // included.
        let _progress = ProgressGuard {
            attempts: &self.attempts,
            name: operation_name.to_string(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.attempts.insert(
                operation_name.to_string(),
                AttemptProgress {
                    current: attempt,
                    max: max_attempts,
                },
            );

            if let Some(ref cb) = breaker
                && let Err(open) = cb.try_acquire()
            {
                debug!(operation = operation_name, %open.reset_at, "breaker refused admission");
                return RetryOutcome::CircuitOpen {
                    reset_at: open.reset_at,
                };
            }

            match operation().await {
                Ok(value) => {
                    if let Some(ref cb) = breaker {
                        cb.record_success();
                    }
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if let Some(ref cb) = breaker {
                        cb.record_failure();
                    }

                    let class = classifier.classify(&error);
                    if !class.is_retryable() || attempt >= max_attempts {
                        return RetryOutcome::Failure {
                            error,
                            attempts: attempt,
                        };
                    }

                    let mut delay = schedule.delay_for_class(attempt, &class);
                    // A server-provided retry-after hint wins when longer.
                    if let Some(hint) = class.retry_after() {
                        delay = delay.max(hint);
                    }
                    debug!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

struct ProgressGuard<'a> {
    attempts: &'a DashMap<String, AttemptProgress>,
    name: String,
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.attempts.remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitConfig;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(BreakerRegistry::new(Arc::new(
            ManualClock::default(),
        ))))
    }

    fn transient(_: &String) -> ErrorClass {
        ErrorClass::TransientNetwork
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let orchestrator = orchestrator();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let outcome: RetryOutcome<&str, String> = orchestrator
            .execute(
                "send-chat-message",
                "chat-backend",
                &RetryPolicy::default(),
                &transient,
                move || {
                    let calls = calls_in.clone();
                    Box::pin(async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok("delivered")
                        }
                    })
                },
            )
            .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, "delivered");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(orchestrator.attempt_progress("send-chat-message").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_invoked_once() {
        let orchestrator = orchestrator();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let outcome: RetryOutcome<(), String> = orchestrator
            .execute(
                "send-like",
                "like-backend",
                &RetryPolicy::default().with_max_attempts(10),
                &(|_: &String| ErrorClass::NonRetryable),
                move || {
                    let calls = calls_in.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("unauthorized".to_string())
                    })
                },
            )
            .await;

        assert!(matches!(
            outcome,
            RetryOutcome::Failure { attempts: 1, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let orchestrator = orchestrator();

        let outcome: RetryOutcome<(), String> = orchestrator
            .execute(
                "search",
                "search-backend",
                &RetryPolicy::no_breaker(),
                &transient,
                || Box::pin(async { Err("still down".to_string()) }),
            )
            .await;

        match outcome {
            RetryOutcome::Failure { error, attempts } => {
                assert_eq!(error, "still down");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits() {
        let clock = ManualClock::default();
        let registry = Arc::new(BreakerRegistry::new(Arc::new(clock.clone())));
        let orchestrator = Orchestrator::new(registry.clone());

        let config = CircuitConfig {
            failure_threshold: 1,
            ..CircuitConfig::default()
        };
        registry.breaker("chat-backend", &config).record_failure();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let policy = RetryPolicy {
            breaker: Some(config),
            ..RetryPolicy::default()
        };
        let outcome: RetryOutcome<(), String> = orchestrator
            .execute("send-chat-message", "chat-backend", &policy, &transient, move || {
                let calls = calls_in.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_trips_mid_loop() {
        let clock = ManualClock::default();
        let registry = Arc::new(BreakerRegistry::new(Arc::new(clock.clone())));
        let orchestrator = Orchestrator::new(registry);

        let config = CircuitConfig {
            failure_threshold: 2,
            ..CircuitConfig::default()
        };
        let policy = RetryPolicy {
            max_attempts: 5,
            breaker: Some(config),
            ..RetryPolicy::default()
        };

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let outcome: RetryOutcome<(), String> = orchestrator
            .execute("report-user", "report-backend", &policy, &transient, move || {
                let calls = calls_in.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                })
            })
            .await;

        // Two failures trip the breaker; the third admission is refused.
        assert!(matches!(outcome, RetryOutcome::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_published_during_flight() {
        let orchestrator = Arc::new(orchestrator());
        let policy = RetryPolicy::no_breaker().with_max_attempts(2);

        let probe = orchestrator.clone();
        let outcome: RetryOutcome<(), String> = orchestrator
            .execute(
                "send-chat-message",
                "chat-backend",
                &policy,
                &transient,
                move || {
                    let progress = probe.attempt_progress("send-chat-message");
                    Box::pin(async move {
                        // Visible from inside the attempt.
                        let progress = progress.expect("progress should be published");
                        assert_eq!(progress.max, 2);
                        Err("down".to_string())
                    })
                },
            )
            .await;

        assert!(!outcome.is_success());
        assert!(orchestrator.attempt_progress("send-chat-message").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_delay() {
        let orchestrator = orchestrator();
        let policy = RetryPolicy::no_breaker().without_jitter().with_max_attempts(2);

        let started = tokio::time::Instant::now();
        let hint = |_: &String| ErrorClass::RateLimited {
            retry_after: Some(Duration::from_secs(120)),
        };
        let outcome: RetryOutcome<(), String> = orchestrator
            .execute("search", "search-backend", &policy, &hint, || {
                Box::pin(async { Err("429".to_string()) })
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Failure { attempts: 2, .. }));
        // The 120s hint dominates the sub-second computed delay.
        assert!(started.elapsed() >= Duration::from_secs(120));
    }
}
