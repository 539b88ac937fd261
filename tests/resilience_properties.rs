//! End-to-end property checks for the resilient operation layer, using
//! injected clocks, in-memory stores, and deterministic jitter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use opguard::{
    ActionKind, Clock, BackoffSchedule, BackoffStrategy, CircuitBreaker, CircuitConfig, CircuitState,
    DeliveryError, DeliveryHandler, ManualClock, MemoryStore, OfflineQueue, QueueConfig,
    RateLimitConfig, RateLimiter, ResilienceLayer, RetryOutcome, RetryPolicy, WindowLimit,
};
use opguard::retry::ErrorClass;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn minute_window(ceiling: usize) -> RateLimitConfig {
    RateLimitConfig::default().with_limit(
        ActionKind::Message,
        WindowLimit::new(ceiling, Duration::from_secs(60)),
    )
}

async fn limiter(clock: &ManualClock, store: Arc<MemoryStore>, ceiling: usize) -> RateLimiter {
    RateLimiter::load(minute_window(ceiling), Arc::new(clock.clone()), store)
        .await
        .unwrap()
}

/// For any sequence of admission checks, admitted calls within a trailing
/// window never exceed the ceiling.
#[tokio::test]
async fn admissions_never_exceed_ceiling_in_any_window() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock, Arc::new(MemoryStore::new()), 5).await;

    let mut admitted: Vec<chrono::DateTime<chrono::Utc>> = Vec::new();
    // Irregular cadence: bursts and gaps over several windows.
    for step in 0..200u64 {
        if limiter.try_admit(ActionKind::Message).await.unwrap() {
            admitted.push(clock.now());
        }
        clock.advance(Duration::from_millis(700 + (step % 13) * 950));
    }

    for end in &admitted {
        let in_window = admitted
            .iter()
            .filter(|t| **t > *end - chrono::TimeDelta::seconds(60) && **t <= *end)
            .count();
        assert!(in_window <= 5, "window ending at {end} holds {in_window}");
    }
}

/// Serializing and reloading window state must not raise the effective
/// ceiling for the remainder of the window.
#[tokio::test]
async fn restart_does_not_reset_quota() {
    let clock = ManualClock::default();
    let store = Arc::new(MemoryStore::new());

    {
        let limiter = limiter(&clock, store.clone(), 3).await;
        for _ in 0..3 {
            assert!(limiter.try_admit(ActionKind::Message).await.unwrap());
        }
    }

    clock.advance(Duration::from_secs(10));
    let relaunched = limiter(&clock, store, 3).await;
    assert!(!relaunched.try_admit(ActionKind::Message).await.unwrap());

    clock.advance(Duration::from_secs(51));
    assert!(relaunched.try_admit(ActionKind::Message).await.unwrap());
}

/// Scenario from the design review: ceiling 3/minute, three admits, fourth
/// denied at the same instant with remaining 0 and ~60s until reset.
#[tokio::test]
async fn denied_fourth_admit_reports_reset() {
    let clock = ManualClock::default();
    let limiter = limiter(&clock, Arc::new(MemoryStore::new()), 3).await;

    for _ in 0..3 {
        assert!(limiter.try_admit(ActionKind::Message).await.unwrap());
    }
    assert!(!limiter.try_admit(ActionKind::Message).await.unwrap());
    assert_eq!(limiter.remaining(ActionKind::Message).await, 0);

    let reset = limiter
        .time_until_reset(ActionKind::Message)
        .await
        .expect("non-empty window has a reset");
    assert!(reset > Duration::from_secs(59) && reset <= Duration::from_secs(60));
}

/// Exponential delays with jitter disabled are exactly base * 2^(n-1),
/// capped at the configured maximum.
#[test]
fn exponential_delay_is_exact() {
    let schedule = BackoffSchedule::new(
        BackoffStrategy::Exponential,
        Duration::from_secs(1),
        Duration::from_secs(6),
    );

    assert_eq!(schedule.delay_with_unit(1, 0.0), Duration::from_secs(1));
    assert_eq!(schedule.delay_with_unit(2, 0.0), Duration::from_secs(2));
    assert_eq!(schedule.delay_with_unit(3, 0.0), Duration::from_secs(4));
    // base * 2^3 = 8s caps at 6s.
    assert_eq!(schedule.delay_with_unit(4, 0.0), Duration::from_secs(6));
}

#[test]
fn breaker_opens_rejects_and_reopens_later() {
    init_logging();
    let clock = ManualClock::default();
    let breaker = CircuitBreaker::new(
        "chat-backend",
        CircuitConfig {
            failure_threshold: 4,
            cooldown: Duration::from_secs(30),
            cooldown_growth: 2.0,
            max_cooldown: Duration::from_secs(300),
        },
        Arc::new(clock.clone()),
    );

    for _ in 0..3 {
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    let first_reset = breaker.reset_at().unwrap();

    // Before resetAt: rejected without running anything.
    clock.advance(Duration::from_secs(29));
    assert!(breaker.try_acquire().is_err());

    // At/after resetAt: exactly one trial.
    clock.advance(Duration::from_secs(1));
    assert!(breaker.try_acquire().is_ok());
    assert!(breaker.try_acquire().is_err());

    // Trial failure reopens with a strictly later reset (tolerant config).
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.reset_at().unwrap() > first_reset);
}

/// Fails twice then succeeds with maxAttempts = 3: success on attempt 3,
/// exactly three invocations.
#[tokio::test(start_paused = true)]
async fn orchestrator_recovers_transient_failures() {
    init_logging();
    let layer = ResilienceLayer::builder()
        .clock(Arc::new(ManualClock::default()))
        .build()
        .await
        .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let outcome: RetryOutcome<&str, String> = layer
        .run(
            ActionKind::Message,
            "send-chat-message:convo-9",
            "chat-backend",
            &RetryPolicy::default(),
            &(|_: &String| ErrorClass::TransientNetwork),
            move || {
                let calls = calls_in.clone();
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok("delivered")
                    }
                })
            },
        )
        .await
        .unwrap();

    match outcome {
        RetryOutcome::Success { value, attempts } => {
            assert_eq!(value, "delivered");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_is_not_retried() {
    let layer = ResilienceLayer::builder().build().await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let calls_in = calls.clone();
    let outcome: RetryOutcome<(), String> = layer
        .run(
            ActionKind::Report,
            "report-user:user-3",
            "report-backend",
            &RetryPolicy::default().with_max_attempts(8),
            &(|_: &String| ErrorClass::NonRetryable),
            move || {
                let calls = calls_in.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden".to_string())
                })
            },
        )
        .await
        .unwrap();

    assert!(matches!(outcome, RetryOutcome::Failure { attempts: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Aborting a run while it waits out a backoff gap releases its in-flight
/// key and removes its published attempt progress, so the same logical
/// operation can be rerun immediately.
#[tokio::test(start_paused = true)]
async fn aborted_run_releases_key_and_progress() {
    init_logging();
    let layer = Arc::new(
        ResilienceLayer::builder()
            .clock(Arc::new(ManualClock::default()))
            .build()
            .await
            .unwrap(),
    );
    let key = "send-chat-message:convo-4";

    let (attempted_tx, mut attempted_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let task = {
        let layer = layer.clone();
        tokio::spawn(async move {
            let policy = RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(300),
                ..RetryPolicy::default().without_jitter()
            };
            layer
                .run(
                    ActionKind::Message,
                    "send-chat-message:convo-4",
                    "chat-backend",
                    &policy,
                    &(|_: &String| ErrorClass::TransientNetwork),
                    move || {
                        let attempted = attempted_tx.clone();
                        Box::pin(async move {
                            let _ = attempted.send(());
                            Err::<(), String>("flaky".to_string())
                        })
                    },
                )
                .await
        })
    };

    // First attempt has failed; the run is parked in its backoff sleep.
    attempted_rx.recv().await.unwrap();
    assert!(layer.in_flight().is_in_flight(key));
    assert!(layer.orchestrator().attempt_progress(key).is_some());

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    // Both the dedupe key and the progress entry are gone.
    assert!(layer.orchestrator().attempt_progress(key).is_none());
    assert!(!layer.in_flight().is_in_flight(key));

    let rerun: RetryOutcome<(), String> = layer
        .run(
            ActionKind::Message,
            key,
            "chat-backend",
            &RetryPolicy::no_breaker(),
            &(|_: &String| ErrorClass::TransientNetwork),
            || Box::pin(async { Ok(()) }),
        )
        .await
        .unwrap();
    assert!(rerun.is_success());
}

struct NeverValidates;

#[async_trait::async_trait]
impl DeliveryHandler<String> for NeverValidates {
    async fn validate(&self, _payload: &String) -> Result<bool, DeliveryError> {
        Err(DeliveryError("backend unreachable".to_string()))
    }

    async fn send(&self, _payload: &String) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// An entry never validated is gone from the queue once its age exceeds the
/// maximum, even with attempt budget left.
#[tokio::test]
async fn queue_entry_expires_by_age() {
    let clock = ManualClock::default();
    let config = QueueConfig {
        max_age: Duration::from_secs(600),
        ..QueueConfig::default()
    };
    let queue: OfflineQueue<String> = OfflineQueue::load(
        config,
        Arc::new(clock.clone()),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap();

    queue.enqueue("never delivered".to_string()).await.unwrap();
    queue.drain(&NeverValidates).await.unwrap();
    assert_eq!(queue.pending().await[0].attempts, 1);

    clock.advance(Duration::from_secs(601));
    let report = queue.drain(&NeverValidates).await.unwrap();
    assert_eq!(report.expired, 1);
    assert!(queue.is_empty().await);
}
