//! Retry executor
//!
//! Re-invokes a fallible async operation according to a [`RetryConfig`].
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible for retry. Rejections from nested
//!   engines (`CallNotPermitted`, `RequestNotPermitted`, `MaxRetriesExceeded`) return
//!   immediately with an `Error` event.
//! - An error matching an ignore rule is returned at once with an `IgnoredError` event and does
//!   not count as an attempt.
//! - A retryable error waits `interval_function.apply(attempt)` through the [`Sleeper`] and tries
//!   again. On the last attempt the error is returned as-is, or wrapped in
//!   `MaxRetriesExceeded` when `fail_after_max_attempts` is set.
//! - A success value matching `retry_on_result` is retried like a retryable error. When the
//!   attempts run out the value is returned (or `MaxRetriesExceeded` with no error).
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - An always-failing retryable operation produces `max_attempts - 1` `Retry` events followed
//!   by exactly one `Error` event.
//! - Each top-level call gets its own [`RetryContext`]; concurrent calls never share one.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use lifeguard::retry::{Retry, RetryConfig};
//! use lifeguard::ResilienceError;
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = RetryConfig::builder()
//!     .max_attempts(3)
//!     .wait_duration(Duration::from_millis(10))
//!     .build()
//!     .unwrap();
//! let retry = Retry::of("backend", config);
//! let result: Result<(), ResilienceError<MyErr>> =
//!     retry.execute(|| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert!(result.is_err());
//! assert_eq!(retry.metrics().failed_calls_with_retry, 1);
//! # });
//! ```

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

use crate::classifier::{Classification, ErrorClassifier, ErrorMatcher, ResultMatcher};
use crate::error::{find_rejection, ConfigError, ResilienceError};
use crate::event::{EventPublisher, RetryEvent, RetryEventKind};
use crate::interval::IntervalFunction;
use crate::registry::RegistryEntry;
use crate::sleeper::{Sleeper, TokioSleeper};

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Immutable retry settings. Shared between instances through `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    max_attempts: usize,
    interval_function: IntervalFunction,
    classifier: ErrorClassifier,
    retry_on_result: Option<ResultMatcher>,
    fail_after_max_attempts: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval_function: IntervalFunction::of_defaults(),
            classifier: ErrorClassifier::default(),
            retry_on_result: None,
            fail_after_max_attempts: false,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder { config: Self::default() }
    }

    /// Builder pre-populated with every setting of `base`.
    pub fn from_base(base: &RetryConfig) -> RetryConfigBuilder {
        RetryConfigBuilder { config: base.clone() }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn interval_function(&self) -> &IntervalFunction {
        &self.interval_function
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn retry_on_result(&self) -> Option<&ResultMatcher> {
        self.retry_on_result.as_ref()
    }

    pub fn fail_after_max_attempts(&self) -> bool {
        self.fail_after_max_attempts
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Constant wait between attempts.
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.interval_function = IntervalFunction::of(wait);
        self
    }

    pub fn interval_function(mut self, interval_function: IntervalFunction) -> Self {
        self.config.interval_function = interval_function;
        self
    }

    /// Retry errors accepted by `matcher`. Without any `retry_on` rule every error is retried.
    pub fn retry_on(mut self, matcher: ErrorMatcher) -> Self {
        self.config.classifier = self.config.classifier.with_match(matcher);
        self
    }

    /// Retry errors of type `T` (anywhere in the source chain).
    pub fn retry_on_error<T: Error + 'static>(self) -> Self {
        self.retry_on(ErrorMatcher::of::<T>())
    }

    /// Never retry errors accepted by `matcher`; they are returned immediately.
    pub fn ignore_on(mut self, matcher: ErrorMatcher) -> Self {
        self.config.classifier = self.config.classifier.with_ignore(matcher);
        self
    }

    pub fn ignore_error<T: Error + 'static>(self) -> Self {
        self.ignore_on(ErrorMatcher::of::<T>())
    }

    /// Retry successful calls whose value is accepted by `matcher`.
    pub fn retry_on_result(mut self, matcher: ResultMatcher) -> Self {
        self.config.retry_on_result = Some(matcher);
        self
    }

    /// Return `MaxRetriesExceeded` instead of the last outcome once attempts run out.
    pub fn fail_after_max_attempts(mut self, enabled: bool) -> Self {
        self.config.fail_after_max_attempts = enabled;
        self
    }

    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        if self.config.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        Ok(self.config)
    }
}

#[derive(Debug, Default)]
struct RetryCounters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

/// Point-in-time call counters of a [`Retry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

struct RetryInner {
    name: Arc<str>,
    config: Arc<RetryConfig>,
    events: EventPublisher<RetryEvent>,
    counters: RetryCounters,
}

/// Named retry executor. Clones share configuration, events and metrics.
#[derive(Clone)]
pub struct Retry {
    inner: Arc<RetryInner>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl Retry {
    pub fn of(name: impl Into<Arc<str>>, config: impl Into<Arc<RetryConfig>>) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                name: name.into(),
                config: config.into(),
                events: EventPublisher::new(),
                counters: RetryCounters::default(),
            }),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn of_defaults(name: impl Into<Arc<str>>) -> Self {
        Self::of(name, RetryConfig::default())
    }

    /// Replace how waits are performed. Clones taken afterwards share the new sleeper.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Arc<RetryConfig> {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<RetryEvent> {
        &self.inner.events
    }

    /// True when both handles refer to the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn metrics(&self) -> RetryMetrics {
        let c = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: c.successful_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: c.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: c.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: c.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Fresh per-call state for callers that drive their own attempt loop.
    pub fn context(&self) -> RetryContext {
        RetryContext { retry: self.clone(), attempts: 0 }
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut context = self.context();
        loop {
            match context.on_outcome(operation().await) {
                Attempt::Done(result) => return result,
                Attempt::RetryAfter(wait) => self.sleeper.sleep(wait).await,
            }
        }
    }

    /// Retry a stream. When it yields an error the stream is rebuilt with `make` and read
    /// again from the start, so items yielded before the failure are yielded again.
    ///
    /// The stream ends after the first error that is not retried, which it yields last.
    pub fn execute_stream<T, E, S, F>(&self, make: F) -> BoxStream<'static, Result<T, ResilienceError<E>>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        S: Stream<Item = Result<T, ResilienceError<E>>> + Send + 'static,
        F: FnMut() -> S + Send + 'static,
    {
        let state = StreamAttempt {
            make,
            current: None,
            context: Some(self.context()),
            sleeper: self.sleeper.clone(),
        };
        stream::unfold(state, |mut state| async move {
            loop {
                let context = state.context.as_mut()?;
                let current = state.current.get_or_insert_with(|| Box::pin((state.make)()));
                match current.next().await {
                    Some(Ok(item)) => return Some((Ok(item), state)),
                    Some(Err(err)) => {
                        state.current = None;
                        match context.on_outcome::<(), E>(Err(err)) {
                            Attempt::RetryAfter(wait) => state.sleeper.sleep(wait).await,
                            Attempt::Done(Err(err)) => {
                                state.context = None;
                                return Some((Err(err), state));
                            }
                            Attempt::Done(Ok(())) => return None,
                        }
                    }
                    None => {
                        let _ = context.on_outcome::<(), E>(Ok(()));
                        return None;
                    }
                }
            }
        })
        .boxed()
    }

    /// Wrap `f` so every invocation runs through [`execute`](Self::execute).
    pub fn decorate<A, T, E, F, Fut>(
        &self,
        f: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync
    where
        A: Clone + Send + Sync + 'static,
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        let retry = self.clone();
        let f = Arc::new(f);
        move |arg: A| {
            let retry = retry.clone();
            let f = f.clone();
            let fut: BoxFuture<'static, Result<T, ResilienceError<E>>> =
                Box::pin(async move { retry.execute(|| f(arg.clone())).await });
            fut
        }
    }

    /// Tower layer applying this retry to a service.
    pub fn layer(&self) -> RetryLayer {
        RetryLayer::new(self.clone())
    }

    fn publish(&self, attempts: usize, last_error: Option<String>, kind: RetryEventKind) {
        let event = RetryEvent::new(self.inner.name.clone(), attempts, last_error, kind);
        self.inner.events.publish(event);
    }

    fn count(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl RegistryEntry for Retry {
    type Config = RetryConfig;

    fn create(name: &str, config: Arc<RetryConfig>) -> Self {
        Retry::of(name, config)
    }

    fn name(&self) -> &str {
        Retry::name(self)
    }

    fn same_instance(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

struct StreamAttempt<F, S> {
    make: F,
    current: Option<Pin<Box<S>>>,
    /// `None` once the stream has ended with an error.
    context: Option<RetryContext>,
    sleeper: Arc<dyn Sleeper>,
}

/// What the caller of [`RetryContext::on_outcome`] should do next.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Stop and hand this result to the caller.
    Done(Result<T, ResilienceError<E>>),
    /// Wait this long, then invoke the operation again.
    RetryAfter(Duration),
}

/// Per-call retry state: how many attempts have failed so far.
#[derive(Debug)]
pub struct RetryContext {
    retry: Retry,
    attempts: usize,
}

impl RetryContext {
    /// Failed attempts counted so far (ignored errors are not counted).
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Feed the outcome of one attempt and learn whether to retry.
    pub fn on_outcome<T, E>(&mut self, outcome: Result<T, ResilienceError<E>>) -> Attempt<T, E>
    where
        T: 'static,
        E: Error + 'static,
    {
        match outcome {
            Ok(value) => self.on_value(value),
            Err(ResilienceError::Inner(e)) => self.on_error(e),
            Err(rejection) => {
                self.attempts += 1;
                tracing::debug!(
                    target: "lifeguard::retry",
                    name = %self.retry.inner.name,
                    error = %rejection,
                    "not retrying engine rejection"
                );
                self.fail(Some(rejection.to_string()));
                Attempt::Done(Err(rejection))
            }
        }
    }

    fn config(&self) -> &RetryConfig {
        &self.retry.inner.config
    }

    fn on_value<T: 'static, E>(&mut self, value: T) -> Attempt<T, E> {
        let rejected = self.config().retry_on_result.as_ref().is_some_and(|m| m.matches(&value));
        if !rejected {
            if self.attempts > 0 {
                self.retry.count(&self.retry.inner.counters.successful_with_retry);
                self.retry.publish(self.attempts, None, RetryEventKind::Success);
            } else {
                self.retry.count(&self.retry.inner.counters.successful_without_retry);
            }
            return Attempt::Done(Ok(value));
        }

        self.attempts += 1;
        if self.attempts >= self.config().max_attempts {
            self.fail(None);
            return Attempt::Done(if self.config().fail_after_max_attempts {
                Err(self.exhausted(None))
            } else {
                Ok(value)
            });
        }
        self.schedule(None)
    }

    fn on_error<T, E: Error + 'static>(&mut self, e: E) -> Attempt<T, E> {
        // A rejection from a nested tower layer arrives wrapped as an ordinary error.
        if find_rejection(&e).is_some() {
            self.attempts += 1;
            tracing::debug!(
                target: "lifeguard::retry",
                name = %self.retry.inner.name,
                error = %e,
                "not retrying nested engine rejection"
            );
            self.fail(Some(e.to_string()));
            return Attempt::Done(Err(ResilienceError::Inner(e)));
        }
        match self.config().classifier.classify(&e) {
            Classification::Ignore => {
                tracing::debug!(
                    target: "lifeguard::retry",
                    name = %self.retry.inner.name,
                    error = %e,
                    "ignoring error"
                );
                self.retry.publish(self.attempts, Some(e.to_string()), RetryEventKind::IgnoredError);
                Attempt::Done(Err(ResilienceError::Inner(e)))
            }
            Classification::Fail => {
                self.attempts += 1;
                self.fail(Some(e.to_string()));
                Attempt::Done(Err(ResilienceError::Inner(e)))
            }
            Classification::Retry => {
                self.attempts += 1;
                if self.attempts < self.config().max_attempts {
                    return self.schedule(Some(e.to_string()));
                }
                self.fail(Some(e.to_string()));
                if self.config().fail_after_max_attempts {
                    Attempt::Done(Err(self.exhausted(Some(e))))
                } else {
                    Attempt::Done(Err(ResilienceError::Inner(e)))
                }
            }
        }
    }

    fn schedule<T, E>(&self, last_error: Option<String>) -> Attempt<T, E> {
        let wait = self.config().interval_function.apply(self.attempts);
        tracing::debug!(
            target: "lifeguard::retry",
            name = %self.retry.inner.name,
            attempt = self.attempts,
            ?wait,
            "retrying after failed attempt"
        );
        self.retry.publish(self.attempts, last_error, RetryEventKind::Retry { wait_interval: wait });
        Attempt::RetryAfter(wait)
    }

    fn fail(&self, last_error: Option<String>) {
        let counters = &self.retry.inner.counters;
        if self.attempts > 1 {
            self.retry.count(&counters.failed_with_retry);
        } else {
            self.retry.count(&counters.failed_without_retry);
        }
        self.retry.publish(self.attempts, last_error, RetryEventKind::Error);
    }

    fn exhausted<E>(&self, last_error: Option<E>) -> ResilienceError<E> {
        tracing::warn!(
            target: "lifeguard::retry",
            name = %self.retry.inner.name,
            attempts = self.attempts,
            "retries exhausted"
        );
        ResilienceError::MaxRetriesExceeded {
            name: self.retry.inner.name.clone(),
            attempts: self.attempts,
            last_error,
        }
    }
}

impl EventPublisher<RetryEvent> {
    pub fn on_retry<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| matches!(e.kind, RetryEventKind::Retry { .. }), listener)
    }

    pub fn on_error<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| e.kind == RetryEventKind::Error, listener)
    }

    pub fn on_ignored_error<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| e.kind == RetryEventKind::IgnoredError, listener)
    }

    pub fn on_success<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| e.kind == RetryEventKind::Success, listener)
    }
}

/// Tower-native retry layer.
#[derive(Debug, Clone)]
pub struct RetryLayer {
    retry: Retry,
}

impl RetryLayer {
    pub fn new(retry: Retry) -> Self {
        Self { retry }
    }
}

/// Retry service produced by `RetryLayer`.
#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    retry: Retry,
}

impl<S, Request> Service<Request> for RetryService<S>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Error + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Every attempt drives readiness on its own clone of the inner service.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let retry = self.retry.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            retry
                .execute(move || {
                    let attempt = inner.clone().oneshot(req.clone());
                    async move { attempt.await.map_err(ResilienceError::Inner) }
                })
                .await
        })
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;
    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, retry: self.retry.clone() }
    }
}
