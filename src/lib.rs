#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Lifeguard
//!
//! Resilience decorators for async Rust: retry, sliding-window circuit breaker, rate limiter,
//! and named registries to share them.
//!
//! ## Features
//!
//! - **Retry** with error classification and interval functions (constant, exponential,
//!   randomized)
//! - **Circuit breaker** over a count- or time-based sliding window with slow-call detection
//! - **Rate limiter** handing out a fixed number of permits per refresh cycle
//! - **Registries** that give every name exactly one engine instance
//! - **Events** as synchronous listeners or a broadcast stream
//! - **tower** layers for every engine
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeguard::{IntervalFunction, ResilienceError, Retry, RetryConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RetryConfig::builder()
//!         .max_attempts(3)
//!         .interval_function(
//!             IntervalFunction::of_exponential_backoff(Duration::from_millis(100), 2.0).unwrap(),
//!         )
//!         .build()
//!         .unwrap();
//!     let retry = Retry::of("backend", config);
//!
//!     let result = retry.execute(|| async {
//!         // Your async operation here
//!         Ok::<_, ResilienceError<std::io::Error>>(())
//!     }).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod adaptive;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod decorators;
pub mod error;
pub mod event;
pub mod interval;
pub mod prelude;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod stack;

// Re-exports
pub use adaptive::DynamicConfig;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitState, SlidingWindowType,
};
pub use classifier::{ErrorClassifier, ErrorMatcher, OutcomeMatcher, ResultMatcher};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ConfigError, ResilienceError};
pub use event::EventPublisher;
pub use interval::IntervalFunction;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterLayer};
pub use registry::{
    CircuitBreakerRegistry, RateLimiterRegistry, Registry, RegistryEntry, RetryRegistry,
};
pub use retry::{Retry, RetryConfig, RetryLayer};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
