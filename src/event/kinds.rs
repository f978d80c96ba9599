use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::circuit_breaker::CircuitState;

/// Emitted by a [`Retry`](crate::retry::Retry) for each decision it takes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    /// Attempts counted so far, including the one that produced this event.
    pub attempts: usize,
    /// Rendered error of the attempt, when the attempt failed with an error.
    pub last_error: Option<String>,
    pub kind: RetryEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEventKind {
    /// The call failed and will be re-invoked after `wait_interval`.
    Retry { wait_interval: Duration },
    /// The call failed for good.
    Error,
    /// The error matched an ignore rule and was passed through without retrying.
    IgnoredError,
    /// The call succeeded after at least one retry.
    Success,
}

impl RetryEvent {
    pub(crate) fn new(
        name: Arc<str>,
        attempts: usize,
        last_error: Option<String>,
        kind: RetryEventKind,
    ) -> Self {
        Self { name, created_at: SystemTime::now(), attempts, last_error, kind }
    }
}

impl RetryEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "RETRY",
            Self::Error => "ERROR",
            Self::IgnoredError => "IGNORED_ERROR",
            Self::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Retry '{}' {} (attempts={}", self.name, self.kind.label(), self.attempts)?;
        if let RetryEventKind::Retry { wait_interval } = self.kind {
            write!(f, ", wait={:?}", wait_interval)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, ", error={}", err)?;
        }
        write!(f, ")")
    }
}

/// Emitted by a [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker).
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: CircuitBreakerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEventKind {
    Success { elapsed: Duration },
    Error { elapsed: Duration, error: String },
    IgnoredError { elapsed: Duration, error: String },
    CallNotPermitted,
    StateTransition { from: CircuitState, to: CircuitState },
    Reset,
    FailureRateExceeded { failure_rate: f32 },
    SlowCallRateExceeded { slow_call_rate: f32 },
}

impl CircuitBreakerEvent {
    pub(crate) fn new(name: Arc<str>, kind: CircuitBreakerEventKind) -> Self {
        Self { name, created_at: SystemTime::now(), kind }
    }
}

impl CircuitBreakerEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "SUCCESS",
            Self::Error { .. } => "ERROR",
            Self::IgnoredError { .. } => "IGNORED_ERROR",
            Self::CallNotPermitted => "NOT_PERMITTED",
            Self::StateTransition { .. } => "STATE_TRANSITION",
            Self::Reset => "RESET",
            Self::FailureRateExceeded { .. } => "FAILURE_RATE_EXCEEDED",
            Self::SlowCallRateExceeded { .. } => "SLOW_CALL_RATE_EXCEEDED",
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CircuitBreaker '{}' ", self.name)?;
        match &self.kind {
            CircuitBreakerEventKind::Success { elapsed } => {
                write!(f, "recorded a successful call (elapsed={:?})", elapsed)
            }
            CircuitBreakerEventKind::Error { elapsed, error } => {
                write!(f, "recorded an error: {} (elapsed={:?})", error, elapsed)
            }
            CircuitBreakerEventKind::IgnoredError { elapsed, error } => {
                write!(f, "ignored an error: {} (elapsed={:?})", error, elapsed)
            }
            CircuitBreakerEventKind::CallNotPermitted => write!(f, "rejected a call"),
            CircuitBreakerEventKind::StateTransition { from, to } => {
                write!(f, "changed state from {} to {}", from, to)
            }
            CircuitBreakerEventKind::Reset => write!(f, "was reset"),
            CircuitBreakerEventKind::FailureRateExceeded { failure_rate } => {
                write!(f, "exceeded failure rate threshold (rate={}%)", failure_rate)
            }
            CircuitBreakerEventKind::SlowCallRateExceeded { slow_call_rate } => {
                write!(f, "exceeded slow call rate threshold (rate={}%)", slow_call_rate)
            }
        }
    }
}

/// Emitted by a [`RateLimiter`](crate::rate_limiter::RateLimiter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterEvent {
    pub name: Arc<str>,
    pub created_at: SystemTime,
    pub kind: RateLimiterEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEventKind {
    SuccessfulAcquire { permits: u32 },
    FailedAcquire { permits: u32 },
    /// Permits of the current cycle were dropped; `permits` is how many were left.
    Drained { permits: u32 },
}

impl RateLimiterEvent {
    pub(crate) fn new(name: Arc<str>, kind: RateLimiterEventKind) -> Self {
        Self { name, created_at: SystemTime::now(), kind }
    }
}

impl RateLimiterEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SuccessfulAcquire { .. } => "SUCCESSFUL_ACQUIRE",
            Self::FailedAcquire { .. } => "FAILED_ACQUIRE",
            Self::Drained { .. } => "DRAINED",
        }
    }
}

impl fmt::Display for RateLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let permits = match self.kind {
            RateLimiterEventKind::SuccessfulAcquire { permits }
            | RateLimiterEventKind::FailedAcquire { permits }
            | RateLimiterEventKind::Drained { permits } => permits,
        };
        write!(f, "RateLimiter '{}' {} (permits={})", self.name, self.kind.label(), permits)
    }
}
