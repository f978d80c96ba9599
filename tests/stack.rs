mod common;

use common::TestError;
use lifeguard::error::{find_rejection, Rejection};
use lifeguard::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, InstantSleeper, ManualClock, RateLimiter,
    RateLimiterConfig, ResilienceError, ResilienceStack, Retry, RetryConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Service, ServiceBuilder, ServiceExt};

fn retry(max_attempts: usize) -> Retry {
    Retry::of("stack", RetryConfig::builder().max_attempts(max_attempts).build().unwrap())
        .with_sleeper(InstantSleeper)
}

fn limiter(limit: u32) -> RateLimiter {
    let config = RateLimiterConfig::builder()
        .limit_for_period(limit)
        .limit_refresh_period(Duration::from_secs(1))
        .timeout_duration(Duration::ZERO)
        .build()
        .unwrap();
    RateLimiter::of("stack", config).with_clock(ManualClock::new()).with_sleeper(InstantSleeper)
}

#[tokio::test]
async fn retry_retries_inner_errors_then_succeeds() {
    let stack = ResilienceStack::builder()
        .retry(retry(3))
        .circuit_breaker(CircuitBreaker::of_defaults("stack"))
        .build();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let result = stack
        .execute(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ResilienceError::Inner(TestError::new("flaky")))
                } else {
                    Ok::<_, ResilienceError<TestError>>(n)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let metrics = stack.circuit_breaker().unwrap().metrics();
    assert_eq!(metrics.buffered_calls, 3);
    assert_eq!(metrics.failed_calls, 2);
}

#[tokio::test]
async fn each_attempt_takes_a_permit_and_denial_is_final() {
    let stack = ResilienceStack::builder().retry(retry(5)).rate_limiter(limiter(2)).build();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    let err = stack
        .execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ResilienceError::Inner(TestError::new("down"))) }
        })
        .await
        .unwrap_err();

    assert!(err.is_request_not_permitted());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tower_layers_compose_in_the_same_order() {
    let breaker = CircuitBreaker::of(
        "svc",
        CircuitBreakerConfig::builder()
            .sliding_window_size(3)
            .minimum_number_of_calls(3)
            .build()
            .unwrap(),
    )
    .with_clock(ManualClock::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut svc = ServiceBuilder::new()
        .layer(retry(5).layer())
        .layer(breaker.layer())
        .layer(limiter(10).layer())
        .service(service_fn(move |_req: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::new("down")) }
        }));

    let err = svc.ready().await.unwrap().call(()).await.unwrap_err();

    // three failures open the breaker; retry stops at the nested rejection
    assert_eq!(find_rejection(&err), Some(Rejection::CallNotPermitted));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn outer_retry_does_not_repeat_an_exhausted_inner_retry() {
    let inner = Retry::of(
        "inner",
        RetryConfig::builder().max_attempts(2).fail_after_max_attempts(true).build().unwrap(),
    )
    .with_sleeper(InstantSleeper);
    let outer = retry(3);
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = errors.clone();
    outer.events().on_error(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut svc = ServiceBuilder::new().layer(outer.layer()).layer(inner.layer()).service(
        service_fn(move |_req: ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::new("down")) }
        }),
    );

    let err = svc.ready().await.unwrap().call(()).await.unwrap_err();

    assert_eq!(find_rejection(&err), Some(Rejection::MaxRetriesExceeded));
    assert!(matches!(
        err,
        ResilienceError::Inner(ResilienceError::MaxRetriesExceeded { attempts: 2, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(outer.metrics().failed_calls_without_retry, 1);
}
