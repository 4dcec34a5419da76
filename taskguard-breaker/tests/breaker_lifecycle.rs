//! Integration tests for the full breaker lifecycle through the guarded-call API.
//!
//! Threshold 3, short recovery: trip, reject without invoking, admit a single
//! trial, then either close or re-open depending on the trial's outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use taskguard_breaker::{BreakerConfig, CallError, CircuitBreaker, CircuitState};

const RECOVERY: Duration = Duration::from_millis(60);

fn make_breaker() -> CircuitBreaker {
    CircuitBreaker::new(BreakerConfig {
        failure_threshold: 3,
        recovery_time: RECOVERY,
        call_timeout: None,
    })
}

async fn failing_call(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CallError<String>> {
    breaker
        .call("remote", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("unavailable".to_owned()) }
        })
        .await
}

#[tokio::test]
async fn three_failures_open_then_reject_without_invoking() {
    let breaker = make_breaker();
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let err = failing_call(&breaker, &calls).await.unwrap_err();
        assert!(matches!(err, CallError::Inner(_)));
    }
    assert_eq!(breaker.state("remote"), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let err = failing_call(&breaker, &calls).await.unwrap_err();
    assert!(err.is_rejected());
    assert_eq!(calls.load(Ordering::SeqCst), 3, "rejected call must not run");
    assert_eq!(breaker.consecutive_failures("remote"), 3);
}

#[tokio::test]
async fn trial_success_closes_circuit() {
    let breaker = make_breaker();
    let calls = AtomicU32::new(0);
    for _ in 0..3 {
        let _ = failing_call(&breaker, &calls).await;
    }

    tokio::time::sleep(RECOVERY + Duration::from_millis(20)).await;
    assert_eq!(breaker.state("remote"), CircuitState::HalfOpen);

    let value: Result<u32, CallError<String>> = breaker.call("remote", || async { Ok(7) }).await;
    assert_eq!(value.unwrap(), 7);
    assert_eq!(breaker.state("remote"), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures("remote"), 0);
}

#[tokio::test]
async fn trial_failure_reopens_and_restarts_timer() {
    let breaker = make_breaker();
    let calls = AtomicU32::new(0);
    for _ in 0..3 {
        let _ = failing_call(&breaker, &calls).await;
    }

    tokio::time::sleep(RECOVERY + Duration::from_millis(20)).await;
    let err = failing_call(&breaker, &calls).await.unwrap_err();
    assert!(matches!(err, CallError::Inner(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state("remote"), CircuitState::Open);

    // Timer restarted at the trial failure.
    let err = failing_call(&breaker, &calls).await.unwrap_err();
    assert!(err.is_rejected());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_trial_admitted_under_contention() {
    let breaker = Arc::new(make_breaker());
    for _ in 0..3 {
        breaker.record_failure("remote");
    }
    tokio::time::sleep(RECOVERY + Duration::from_millis(20)).await;

    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    let invoked = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let breaker = Arc::clone(&breaker);
        let invoked = Arc::clone(&invoked);
        let mut release_rx = release_rx.clone();
        tasks.push(tokio::spawn(async move {
            breaker
                .call("remote", || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let _ = release_rx.wait_for(|released| *released).await;
                        Ok::<_, String>(())
                    }
                })
                .await
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = release_tx.send(true);

    let mut admitted = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => admitted += 1,
            Err(e) if e.is_rejected() => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(rejected, 7);
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state("remote"), CircuitState::Closed);
}
