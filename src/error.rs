//! Error types for resilience engines
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitState;

/// Unified error type returned by every decorated call.
///
/// `Inner` carries the operation's own error untouched; the remaining variants are
/// rejections produced by an engine without (or after) invoking the operation.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker refused the call
    CallNotPermitted { name: Arc<str>, state: CircuitState },
    /// The rate limiter could not grant a permit within its timeout
    RequestNotPermitted { name: Arc<str>, timeout: Duration },
    /// Retries were exhausted and the retry is configured to fail instead of passing the error through
    MaxRetriesExceeded { name: Arc<str>, attempts: usize, last_error: Option<E> },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallNotPermitted { name, state } => {
                write!(f, "circuit breaker '{}' is {} and does not permit further calls", name, state)
            }
            Self::RequestNotPermitted { name, timeout } => {
                write!(f, "rate limiter '{}' does not permit further calls (waited {:?})", name, timeout)
            }
            Self::MaxRetriesExceeded { name, attempts, last_error } => match last_error {
                Some(last) => write!(
                    f,
                    "retry '{}' has exhausted all attempts ({}); last error: {}",
                    name, attempts, last
                ),
                None => write!(
                    f,
                    "retry '{}' has exhausted all attempts ({}); last result was rejected",
                    name, attempts
                ),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            // the last error stays on the variant; the chain has to surface the rejection
            Self::MaxRetriesExceeded { .. } => Some(&Rejection::MaxRetriesExceeded),
            Self::CallNotPermitted { .. } => Some(&Rejection::CallNotPermitted),
            Self::RequestNotPermitted { .. } => Some(&Rejection::RequestNotPermitted),
        }
    }
}

/// Kind of engine rejection, reachable through [`Error::source`](std::error::Error::source).
///
/// Stacked tower layers nest their error types, so an outer engine sees an inner engine's
/// rejection as an ordinary error. [`find_rejection`] recovers it from the source chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CallNotPermitted,
    RequestNotPermitted,
    MaxRetriesExceeded,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Rejection::CallNotPermitted => "call not permitted",
            Rejection::RequestNotPermitted => "request not permitted",
            Rejection::MaxRetriesExceeded => "max retries exceeded",
        })
    }
}

impl std::error::Error for Rejection {}

/// First engine rejection found in `err` or its source chain.
pub fn find_rejection(err: &(dyn std::error::Error + 'static)) -> Option<Rejection> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(rejection) = e.downcast_ref::<Rejection>() {
            return Some(*rejection);
        }
        current = e.source();
    }
    None
}

impl<E> ResilienceError<E> {
    /// Check if a circuit breaker rejected the call
    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, Self::CallNotPermitted { .. })
    }
    /// Check if a rate limiter rejected the call
    pub fn is_request_not_permitted(&self) -> bool {
        matches!(self, Self::RequestNotPermitted { .. })
    }
    /// Check if this error is due to retry exhaustion
    pub fn is_max_retries_exceeded(&self) -> bool {
        matches!(self, Self::MaxRetriesExceeded { .. })
    }
    /// Check if this error wraps the operation's own error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// True for every variant produced by an engine rather than the operation.
    pub fn is_rejection(&self) -> bool {
        !self.is_inner()
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Name of the engine that rejected the call, if any.
    pub fn engine_name(&self) -> Option<&str> {
        match self {
            Self::CallNotPermitted { name, .. }
            | Self::RequestNotPermitted { name, .. }
            | Self::MaxRetriesExceeded { name, .. } => Some(name),
            Self::Inner(_) => None,
        }
    }
    /// Map the operation error type, keeping rejections intact.
    pub fn map_inner<F, E2>(self, f: F) -> ResilienceError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::Inner(e) => ResilienceError::Inner(f(e)),
            Self::CallNotPermitted { name, state } => ResilienceError::CallNotPermitted { name, state },
            Self::RequestNotPermitted { name, timeout } => {
                ResilienceError::RequestNotPermitted { name, timeout }
            }
            Self::MaxRetriesExceeded { name, attempts, last_error } => {
                ResilienceError::MaxRetriesExceeded { name, attempts, last_error: last_error.map(f) }
            }
        }
    }
}

/// Invalid builder input or registry configuration lookups.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("{name} must be within (0, 100] percent (got {value})")]
    InvalidThreshold { name: &'static str, value: f32 },
    #[error("sliding_window_size must be at least 1 (got {0})")]
    InvalidWindowSize(u32),
    #[error("minimum_number_of_calls must be at least 1 (got {0})")]
    InvalidMinimumCalls(u32),
    #[error("permitted_number_of_calls_in_half_open_state must be at least 1 (got {0})")]
    InvalidHalfOpenCalls(u32),
    #[error("{name} must be positive (got {value:?})")]
    InvalidWaitDuration { name: &'static str, value: Duration },
    #[error("limit_refresh_period must be positive (got {0:?})")]
    InvalidRefreshPeriod(Duration),
    #[error("limit_for_period must be at least 1 (got {0})")]
    InvalidLimit(u32),
    #[error("required field '{0}' was not set")]
    MissingField(&'static str),
    #[error("invalid interval function: {0}")]
    InvalidInterval(String),
    #[error("configuration name '{0}' is reserved")]
    ReservedConfigName(String),
    #[error("configuration '{0}' not found")]
    ConfigurationNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn call_not_permitted_display_names_breaker_and_state() {
        let err: ResilienceError<io::Error> =
            ResilienceError::CallNotPermitted { name: "backend".into(), state: CircuitState::Open };
        let msg = err.to_string();
        assert!(msg.contains("backend"));
        assert!(msg.contains("OPEN"));
    }

    #[test]
    fn request_not_permitted_display() {
        let err: ResilienceError<io::Error> = ResilienceError::RequestNotPermitted {
            name: "api".into(),
            timeout: Duration::from_millis(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("rate limiter 'api'"));
        assert!(msg.contains("100ms"));
    }

    #[test]
    fn max_retries_display_includes_last_error() {
        let err = ResilienceError::MaxRetriesExceeded {
            name: "svc".into(),
            attempts: 3,
            last_error: Some(DummyError("boom")),
        };
        let msg = err.to_string();
        assert!(msg.contains("3"));
        assert!(msg.contains("last error: boom"));
        assert_eq!(find_rejection(&err), Some(Rejection::MaxRetriesExceeded));
    }

    #[test]
    fn nested_exhaustion_with_last_error_is_a_rejection() {
        let nested: ResilienceError<ResilienceError<DummyError>> =
            ResilienceError::Inner(ResilienceError::MaxRetriesExceeded {
                name: "inner".into(),
                attempts: 2,
                last_error: Some(DummyError("boom")),
            });
        assert_eq!(find_rejection(&nested), Some(Rejection::MaxRetriesExceeded));
    }

    #[test]
    fn max_retries_display_without_error_mentions_result() {
        let err: ResilienceError<DummyError> =
            ResilienceError::MaxRetriesExceeded { name: "svc".into(), attempts: 2, last_error: None };
        assert!(err.to_string().contains("last result was rejected"));
        assert_eq!(find_rejection(&err), Some(Rejection::MaxRetriesExceeded));
    }

    #[test]
    fn nested_rejection_is_found_through_inner() {
        let nested: ResilienceError<ResilienceError<DummyError>> =
            ResilienceError::Inner(ResilienceError::RequestNotPermitted {
                name: "rl".into(),
                timeout: Duration::ZERO,
            });
        assert_eq!(find_rejection(&nested), Some(Rejection::RequestNotPermitted));
        assert_eq!(find_rejection(&ResilienceError::Inner(DummyError("x"))), None);
    }

    #[test]
    fn predicates_cover_all_variants() {
        let cnp: ResilienceError<DummyError> =
            ResilienceError::CallNotPermitted { name: "a".into(), state: CircuitState::HalfOpen };
        assert!(cnp.is_call_not_permitted());
        assert!(cnp.is_rejection());
        assert_eq!(cnp.engine_name(), Some("a"));

        let rnp: ResilienceError<DummyError> =
            ResilienceError::RequestNotPermitted { name: "b".into(), timeout: Duration::ZERO };
        assert!(rnp.is_request_not_permitted());

        let mre: ResilienceError<DummyError> =
            ResilienceError::MaxRetriesExceeded { name: "c".into(), attempts: 1, last_error: None };
        assert!(mre.is_max_retries_exceeded());

        let inner = ResilienceError::Inner(DummyError("x"));
        assert!(inner.is_inner());
        assert!(!inner.is_rejection());
        assert_eq!(inner.engine_name(), None);
        assert_eq!(inner.as_inner(), Some(&DummyError("x")));
        assert_eq!(inner.into_inner(), Some(DummyError("x")));
    }

    #[test]
    fn map_inner_preserves_rejections() {
        let err: ResilienceError<DummyError> =
            ResilienceError::RequestNotPermitted { name: "rl".into(), timeout: Duration::ZERO };
        let mapped = err.map_inner(|e| e.0.len());
        assert!(mapped.is_request_not_permitted());

        let mapped = ResilienceError::Inner(DummyError("four")).map_inner(|e| e.0.len());
        assert_eq!(mapped.into_inner(), Some(4));
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::MissingField("limit_for_period").to_string(),
            "required field 'limit_for_period' was not set"
        );
        assert!(ConfigError::ReservedConfigName("default".into()).to_string().contains("reserved"));
    }
}
