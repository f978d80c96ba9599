use std::error::Error;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use super::CircuitBreaker;
use crate::ResilienceError;

/// A layer that routes every request through a [`CircuitBreaker`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CircuitBreakerService { inner: service, breaker: self.breaker.clone() }
    }
}

/// Middleware service produced by [`CircuitBreakerLayer`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S, Request> Service<Request> for CircuitBreakerService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Error + Send + Sync + 'static,
    S::Future: Send + 'static,
    Request: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let breaker = self.breaker.clone();
        Box::pin(async move {
            breaker
                .execute(move || async move { inner.call(req).await.map_err(ResilienceError::Inner) })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::clock::ManualClock;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug)]
    struct Unavailable;

    impl fmt::Display for Unavailable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "unavailable")
        }
    }

    impl Error for Unavailable {}

    #[tokio::test]
    async fn open_breaker_rejects_without_calling_service() {
        let config = CircuitBreakerConfig::builder()
            .sliding_window_size(2)
            .minimum_number_of_calls(2)
            .wait_duration_in_open_state(Duration::from_secs(5))
            .build()
            .expect("builder");
        let breaker = CircuitBreaker::of("backend", config).with_clock(ManualClock::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = ServiceBuilder::new().layer(breaker.layer()).service(service_fn(move |_req: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<u32, _>(Unavailable) }
        }));

        for _ in 0..2 {
            let err = svc.clone().oneshot(1).await.unwrap_err();
            assert!(err.is_inner());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = svc.clone().oneshot(1).await.unwrap_err();
        assert!(err.is_call_not_permitted());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
