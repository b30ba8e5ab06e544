// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for circuit breakers using only public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tether::{
    BreakerConfig, CircuitBreaker, CircuitBreakerRegistry, CircuitOpenError, CircuitState, Classification, Error,
    ErrorKind, WorkloadId,
};
use tick::{Clock, ClockControl};

const TARGET: &str = "spiffe://example.org/target-A";

fn config(failure_threshold: u32) -> BreakerConfig {
    BreakerConfig {
        failure_threshold,
        success_threshold: 2,
        recovery_timeout: Duration::from_secs(30),
        ..BreakerConfig::default()
    }
}

fn connection_reset() -> Error {
    Error::transport(TARGET, "connection reset by peer")
}

#[tokio::test]
async fn fourth_call_is_rejected_without_running() {
    let breaker = CircuitBreaker::new(TARGET, config(3), Clock::new_frozen()).unwrap();
    let calls = AtomicU32::new(0);
    let counter = &calls;

    for _ in 0..3 {
        let error = breaker
            .call(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(connection_reset())
            })
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Transport);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let error = breaker
        .call(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let Error::CircuitOpen(open) = &error else {
        panic!("expected an open circuit, got {error:?}");
    };
    assert_eq!(open.name(), TARGET);
    assert_eq!(open.metrics().state, CircuitState::Open);
    assert_eq!(open.metrics().consecutive_failures, 3);
    assert_eq!(open.metrics().rejections, 1);
}

#[tokio::test]
async fn recovers_through_half_open_after_timeout() {
    let control = ClockControl::new();
    let breaker = CircuitBreaker::new(TARGET, config(1), control.to_clock()).unwrap();

    breaker.call(|| async { Err::<(), _>(connection_reset()) }).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    control.advance(Duration::from_secs(29));
    let error = breaker.call(|| async { Ok(()) }).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::CircuitOpen);

    control.advance(Duration::from_secs(1));
    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let metrics = breaker.metrics();
    assert_eq!(metrics.times_opened, 1);
    assert_eq!(metrics.consecutive_failures, 0);
}

#[tokio::test]
async fn failed_probe_reopens_and_restarts_timer() {
    let control = ClockControl::new();
    let breaker = CircuitBreaker::new(TARGET, config(1), control.to_clock()).unwrap();

    breaker.call(|| async { Err::<(), _>(connection_reset()) }).await.unwrap_err();
    control.advance(Duration::from_secs(30));

    breaker.call(|| async { Err::<(), _>(connection_reset()) }).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    control.advance(Duration::from_secs(20));
    assert_eq!(
        breaker.call(|| async { Ok(()) }).await.unwrap_err().kind(),
        ErrorKind::CircuitOpen
    );

    control.advance(Duration::from_secs(10));
    breaker.call(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.metrics().times_opened, 2);
}

#[tokio::test]
async fn caller_errors_do_not_trip() {
    let breaker = CircuitBreaker::new(TARGET, config(1), Clock::new_frozen()).unwrap();

    for _ in 0..5 {
        let error = breaker
            .call(|| async { Err::<(), _>(Error::invalid_request("bad path")) })
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidRequest);
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().failures, 0);
}

#[derive(Debug)]
enum AppError {
    Overloaded,
    NotFound,
    Open,
}

impl From<CircuitOpenError> for AppError {
    fn from(_: CircuitOpenError) -> Self {
        Self::Open
    }
}

#[tokio::test]
async fn custom_error_types_plug_in_a_classifier() {
    let breaker = CircuitBreaker::with_classifier(TARGET, config(2), Clock::new_frozen(), |error: &AppError| match error {
        AppError::NotFound => Classification::Excluded,
        AppError::Overloaded | AppError::Open => Classification::Transient,
    })
    .unwrap();

    breaker.call(|| async { Err::<(), _>(AppError::NotFound) }).await.unwrap_err();
    breaker.call(|| async { Err::<(), _>(AppError::Overloaded) }).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Closed);

    breaker.call(|| async { Err::<(), _>(AppError::Overloaded) }).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    let error = breaker.call(|| async { Ok::<_, AppError>(()) }).await.unwrap_err();
    assert!(matches!(error, AppError::Open));
}

#[tokio::test]
async fn registry_isolates_targets() {
    let registry = CircuitBreakerRegistry::new(config(1), Clock::new_frozen()).unwrap();
    let a = WorkloadId::parse("spiffe://example.org/a").unwrap();
    let b = WorkloadId::parse("spiffe://example.org/b").unwrap();

    registry
        .get(&a)
        .call(|| async { Err::<(), _>(connection_reset()) })
        .await
        .unwrap_err();
    registry.get(&b).call(|| async { Ok(()) }).await.unwrap();

    let metrics = registry.metrics();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].name, a.as_str());
    assert_eq!(metrics[0].state, CircuitState::Open);
    assert_eq!(metrics[1].state, CircuitState::Closed);

    assert!(registry.reset(&a));
    assert_eq!(registry.get(&a).state(), CircuitState::Closed);
    assert!(!registry.reset(&WorkloadId::parse("spiffe://example.org/c").unwrap()));
}
