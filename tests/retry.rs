mod common;

use common::{BusinessError, Recorded, TestError};
use lifeguard::classifier::{ErrorMatcher, ResultMatcher};
use lifeguard::event::RetryEventKind;
use lifeguard::{IntervalFunction, ResilienceError, Retry, RetryConfig, TrackingSleeper};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tower::{Service, ServiceBuilder, ServiceExt};

fn retry_with(config: RetryConfig) -> (Retry, TrackingSleeper, Recorded<&'static str>) {
    let sleeper = TrackingSleeper::new();
    let retry = Retry::of("backend", config).with_sleeper(sleeper.clone());
    let labels = Recorded::new();
    let sink = labels.clone();
    retry.events().on_event(move |event| sink.push(event.kind.label()));
    (retry, sleeper, labels)
}

#[tokio::test]
async fn always_failing_operation_emits_retries_then_one_error() {
    let config = RetryConfig::builder()
        .max_attempts(4)
        .wait_duration(Duration::from_millis(10))
        .build()
        .unwrap();
    let (retry, sleeper, labels) = retry_with(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result = retry
        .execute(|| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ResilienceError::Inner(TestError::new("down"))) }
        })
        .await;

    assert_eq!(result.unwrap_err().into_inner(), Some(TestError::new("down")));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(labels.items(), vec!["RETRY", "RETRY", "RETRY", "ERROR"]);
    assert_eq!(sleeper.waits(), vec![Duration::from_millis(10); 3]);
    assert_eq!(retry.metrics().failed_calls_with_retry, 1);
}

#[tokio::test]
async fn fail_fail_succeed_emits_retry_retry_success() {
    let (retry, _sleeper, labels) = retry_with(RetryConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let result = retry
        .execute(|| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ResilienceError::Inner(TestError::new("flaky")))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(labels.items(), vec!["RETRY", "RETRY", "SUCCESS"]);
    let metrics = retry.metrics();
    assert_eq!(metrics.successful_calls_with_retry, 1);
    assert_eq!(metrics.successful_calls_without_retry, 0);
}

#[tokio::test]
async fn first_try_success_emits_nothing() {
    let (retry, sleeper, labels) = retry_with(RetryConfig::default());
    let result = retry.execute(|| async { Ok::<_, ResilienceError<TestError>>("ok") }).await;
    assert_eq!(result.unwrap(), "ok");
    assert!(labels.items().is_empty());
    assert_eq!(sleeper.count(), 0);
    assert_eq!(retry.metrics().successful_calls_without_retry, 1);
}

#[tokio::test]
async fn ignored_error_is_returned_after_one_call() {
    let config = RetryConfig::builder().ignore_error::<BusinessError>().build().unwrap();
    let (retry, sleeper, labels) = retry_with(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let err = retry
        .execute(|| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ResilienceError::Inner(BusinessError)) }
        })
        .await
        .unwrap_err();

    assert_eq!(err.into_inner(), Some(BusinessError));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(labels.items(), vec!["IGNORED_ERROR"]);
    assert_eq!(sleeper.count(), 0);
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("http {0}")]
    Http(u16),
}

#[tokio::test]
async fn ignore_takes_precedence_over_retry_rules() {
    let config = RetryConfig::builder()
        .retry_on(ErrorMatcher::of::<ApiError>())
        .ignore_on(ErrorMatcher::when::<ApiError, _>(|e| matches!(e, ApiError::Http(400..=499))))
        .build()
        .unwrap();
    let (retry, _sleeper, labels) = retry_with(config);

    let _ = retry.execute(|| async { Err::<(), _>(ResilienceError::Inner(ApiError::Http(404))) }).await;
    assert_eq!(labels.items(), vec!["IGNORED_ERROR"]);

    let _ = retry.execute(|| async { Err::<(), _>(ResilienceError::Inner(ApiError::Http(503))) }).await;
    assert_eq!(labels.items(), vec!["IGNORED_ERROR", "RETRY", "RETRY", "ERROR"]);
}

#[tokio::test]
async fn unmatched_error_fails_without_retry() {
    let config = RetryConfig::builder().retry_on_error::<ApiError>().build().unwrap();
    let (retry, sleeper, labels) = retry_with(config);

    let err = retry
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("other"))) })
        .await
        .unwrap_err();

    assert!(err.is_inner());
    assert_eq!(labels.items(), vec!["ERROR"]);
    assert_eq!(sleeper.count(), 0);
    assert_eq!(retry.metrics().failed_calls_without_retry, 1);
}

#[tokio::test]
async fn fail_after_max_attempts_wraps_last_error() {
    let config = RetryConfig::builder()
        .max_attempts(2)
        .fail_after_max_attempts(true)
        .build()
        .unwrap();
    let (retry, _sleeper, _labels) = retry_with(config);

    let err = retry
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("last"))) })
        .await
        .unwrap_err();

    match err {
        ResilienceError::MaxRetriesExceeded { name, attempts, last_error } => {
            assert_eq!(&*name, "backend");
            assert_eq!(attempts, 2);
            assert_eq!(last_error, Some(TestError::new("last")));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn rejected_results_are_retried_and_returned_when_exhausted() {
    let config = RetryConfig::builder()
        .max_attempts(3)
        .retry_on_result(ResultMatcher::when::<&'static str, _>(|v| *v == "pending"))
        .build()
        .unwrap();
    let (retry, _sleeper, labels) = retry_with(config);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let value = retry
        .execute(|| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ResilienceError<TestError>>("pending") }
        })
        .await
        .unwrap();

    assert_eq!(value, "pending");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(labels.items(), vec!["RETRY", "RETRY", "ERROR"]);
}

#[tokio::test]
async fn exponential_interval_grows_between_attempts() {
    let config = RetryConfig::builder()
        .max_attempts(4)
        .interval_function(
            IntervalFunction::of_exponential_backoff(Duration::from_millis(100), 2.0).unwrap(),
        )
        .build()
        .unwrap();
    let (retry, sleeper, _labels) = retry_with(config);

    let _ = retry
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("x"))) })
        .await;

    assert_eq!(
        sleeper.waits(),
        vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
    );
}

#[tokio::test(start_paused = true)]
async fn default_sleeper_waits_on_tokio_time() {
    let config = RetryConfig::builder()
        .max_attempts(3)
        .wait_duration(Duration::from_secs(2))
        .build()
        .unwrap();
    let retry = Retry::of("paused", config);
    let start = tokio::time::Instant::now();

    let _ = retry
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("x"))) })
        .await;

    assert_eq!(start.elapsed(), Duration::from_secs(4));
}

#[tokio::test]
async fn retry_event_carries_wait_and_error() {
    let config = RetryConfig::builder()
        .max_attempts(2)
        .wait_duration(Duration::from_millis(5))
        .build()
        .unwrap();
    let (retry, _sleeper, _labels) = retry_with(config);
    let seen = Recorded::new();
    let sink = seen.clone();
    retry.events().on_retry(move |event| sink.push(event.clone()));

    let _ = retry
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("reset"))) })
        .await;

    let events = seen.items();
    assert_eq!(events.len(), 1);
    assert_eq!(&*events[0].name, "backend");
    assert_eq!(events[0].attempts, 1);
    assert_eq!(events[0].last_error.as_deref(), Some("test error: reset"));
    assert_eq!(events[0].kind, RetryEventKind::Retry { wait_interval: Duration::from_millis(5) });
}

#[tokio::test]
async fn subscribers_receive_events_asynchronously() {
    let (retry, _sleeper, _labels) = retry_with(RetryConfig::default());
    let mut stream = retry.events().subscribe();

    let _ = retry
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("x"))) })
        .await;

    let first = stream.recv().await.unwrap();
    assert_eq!(first.kind.label(), "RETRY");
}

#[tokio::test]
async fn concurrent_calls_do_not_share_attempts() {
    let config = RetryConfig::builder().max_attempts(2).build().unwrap();
    let (retry, _sleeper, labels) = retry_with(config);

    let calls = (0..5).map(|_| {
        retry.execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError::new("x"))) })
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_err()));
    let items = labels.items();
    assert_eq!(items.iter().filter(|l| **l == "RETRY").count(), 5);
    assert_eq!(items.iter().filter(|l| **l == "ERROR").count(), 5);
}

#[tokio::test]
async fn derived_config_keeps_base_values() {
    let base = RetryConfig::builder()
        .max_attempts(5)
        .wait_duration(Duration::from_millis(250))
        .retry_on_error::<ApiError>()
        .fail_after_max_attempts(true)
        .build()
        .unwrap();

    let same = RetryConfig::from_base(&base).build().unwrap();
    assert_eq!(same, base);

    let derived = RetryConfig::from_base(&base).max_attempts(2).build().unwrap();
    assert_eq!(derived.max_attempts(), 2);
    assert_eq!(derived.interval_function(), base.interval_function());
    assert_eq!(derived.classifier(), base.classifier());
    assert!(derived.fail_after_max_attempts());
}

#[tokio::test]
async fn decorated_function_retries_with_its_argument() {
    let (retry, _sleeper, _labels) = retry_with(RetryConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let lookup = retry.decorate(move |id: u32| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err(ResilienceError::Inner(TestError::new("cold cache")))
            } else {
                Ok(id * 10)
            }
        }
    });

    assert_eq!(lookup(4).await.unwrap(), 40);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[derive(Clone)]
struct FlakyService {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl Service<&'static str> for FlakyService {
    type Response = &'static str;
    type Error = TestError;
    type Future = futures::future::Ready<Result<&'static str, TestError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), TestError>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            futures::future::ready(Err(TestError::new("unavailable")))
        } else {
            futures::future::ready(Ok(req))
        }
    }
}

#[tokio::test]
async fn retry_layer_reissues_the_request() {
    let retry = Retry::of("svc", RetryConfig::default()).with_sleeper(TrackingSleeper::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let mut svc = ServiceBuilder::new()
        .layer(retry.layer())
        .service(FlakyService { failures: 2, calls: calls.clone() });

    let response = svc.ready().await.unwrap().call("ping").await.unwrap();
    assert_eq!(response, "ping");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failing_stream_is_read_again_from_the_start() {
    let config = RetryConfig::builder()
        .max_attempts(3)
        .wait_duration(Duration::from_millis(5))
        .build()
        .unwrap();
    let (retry, sleeper, labels) = retry_with(config);

    let items: Vec<_> = retry
        .execute_stream(|| {
            futures::stream::iter(vec![
                Ok(1),
                Ok(2),
                Ok(3),
                Err(ResilienceError::Inner(TestError::new("last integer"))),
            ])
        })
        .collect()
        .await;

    let (values, errors): (Vec<_>, Vec<_>) = items.into_iter().partition(Result::is_ok);
    let values: Vec<i32> = values.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, [1, 2, 3].repeat(3));
    assert_eq!(errors.len(), 1);
    assert_eq!(labels.items(), vec!["RETRY", "RETRY", "ERROR"]);
    assert_eq!(sleeper.waits(), vec![Duration::from_millis(5); 2]);
}

#[tokio::test]
async fn stream_that_recovers_completes_with_success() {
    let (retry, _sleeper, labels) = retry_with(RetryConfig::default());
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();

    let items: Vec<_> = retry
        .execute_stream(move || {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            let tail = if first {
                Err(ResilienceError::Inner(TestError::new("flaky")))
            } else {
                Ok("b")
            };
            futures::stream::iter(vec![Ok("a"), tail])
        })
        .collect()
        .await;

    let items: Vec<&str> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(items, vec!["a", "a", "b"]);
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(labels.items(), vec!["RETRY", "SUCCESS"]);
}
