//! Composition of the engines around one operation.
//!
//! Order, outermost first: Retry → CircuitBreaker → RateLimiter → operation. Every retry
//! attempt passes through the breaker and takes a fresh permit, and a breaker rejection is
//! returned by retry without another attempt.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeguard::{CircuitBreaker, ResilienceError, ResilienceStack, Retry, RetryConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retry = Retry::of(
//!     "inventory",
//!     RetryConfig::builder().wait_duration(Duration::from_millis(1)).build().unwrap(),
//! );
//! let stack = ResilienceStack::builder()
//!     .retry(retry)
//!     .circuit_breaker(CircuitBreaker::of_defaults("inventory"))
//!     .build();
//! let value = stack.execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(7) }).await;
//! assert_eq!(value.unwrap(), 7);
//! # });
//! ```

use std::error::Error;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use crate::{CircuitBreaker, RateLimiter, ResilienceError, Retry};

/// Any subset of the three engines, applied in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct ResilienceStack {
    retry: Option<Retry>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
}

impl ResilienceStack {
    pub fn builder() -> ResilienceStackBuilder {
        ResilienceStackBuilder::default()
    }

    pub fn retry(&self) -> Option<&Retry> {
        self.retry.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // Each attempt builds its inner chain anew, so the operation is shared behind a lock
        // that is held only while the operation produces its future.
        let cell = Mutex::new(operation);
        let op = &cell;
        match &self.retry {
            Some(retry) => retry.execute(move || self.guarded(op)).await,
            None => self.guarded(op).await,
        }
    }

    async fn guarded<T, E, Fut, Op>(&self, op: &Mutex<Op>) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        match &self.circuit_breaker {
            Some(breaker) => breaker.execute(move || self.limited(op)).await,
            None => self.limited(op).await,
        }
    }

    async fn limited<T, E, Fut, Op>(&self, op: &Mutex<Op>) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        match &self.rate_limiter {
            Some(limiter) => limiter.execute(move || invoke(op)).await,
            None => invoke(op).await,
        }
    }
}

fn invoke<Fut, Op: FnMut() -> Fut>(op: &Mutex<Op>) -> Fut {
    let mut op = op.lock().unwrap_or_else(PoisonError::into_inner);
    op()
}

#[derive(Debug, Clone, Default)]
pub struct ResilienceStackBuilder {
    retry: Option<Retry>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
}

impl ResilienceStackBuilder {
    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn build(self) -> ResilienceStack {
        ResilienceStack {
            retry: self.retry,
            circuit_breaker: self.circuit_breaker,
            rate_limiter: self.rate_limiter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::retry::RetryConfig;
    use crate::sleeper::InstantSleeper;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl Error for TestError {}

    #[tokio::test]
    async fn empty_stack_calls_operation_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stack = ResilienceStack::builder().build();
        let result = stack
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::Inner(TestError("no".into()))) }
            })
            .await;
        assert!(result.unwrap_err().is_inner());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_stops_at_open_breaker() {
        let retry = Retry::of(
            "svc",
            RetryConfig::builder().max_attempts(5).build().expect("builder"),
        )
        .with_sleeper(InstantSleeper);
        let breaker = CircuitBreaker::of(
            "svc",
            CircuitBreakerConfig::builder()
                .sliding_window_size(2)
                .minimum_number_of_calls(2)
                .build()
                .expect("builder"),
        )
        .with_clock(ManualClock::new());
        let stack = ResilienceStack::builder().retry(retry).circuit_breaker(breaker.clone()).build();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = stack
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::Inner(TestError("down".into()))) }
            })
            .await
            .unwrap_err();

        // two failures open the breaker; the third attempt is rejected and not retried
        assert!(err.is_call_not_permitted());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.metrics().not_permitted_calls, 1);
    }
}
