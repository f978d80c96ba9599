//! Convenient re-exports for common Lifeguard types.
pub use crate::{
    circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState, SlidingWindowType,
    },
    classifier::{CallOutcome, ErrorMatcher, OutcomeMatcher, ResultMatcher},
    decorators::{recover, recover_when},
    event::{CircuitBreakerEvent, EventPublisher, RateLimiterEvent, RetryEvent},
    interval::IntervalFunction,
    rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterLayer},
    registry::{CircuitBreakerRegistry, RateLimiterRegistry, RetryRegistry},
    retry::{Retry, RetryConfig, RetryLayer},
    ConfigError, ResilienceError, ResilienceStack,
};
