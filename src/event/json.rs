//! JSON rendering of engine events (feature `telemetry-json`).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use super::{
    CircuitBreakerEvent, CircuitBreakerEventKind, RateLimiterEvent, RateLimiterEventKind,
    RetryEvent, RetryEventKind,
};

/// Events that can be rendered as a flat JSON object.
pub trait EventJson {
    fn to_json(&self) -> Value;
}

fn clamp_u64(val: u128) -> u64 {
    u64::try_from(val).unwrap_or(u64::MAX)
}

fn millis(duration: Duration) -> u64 {
    clamp_u64(duration.as_millis())
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).map(millis).unwrap_or(0)
}

impl EventJson for RetryEvent {
    fn to_json(&self) -> Value {
        let mut value = json!({
            "engine": "retry",
            "name": &*self.name,
            "type": self.kind.label(),
            "created_at_ms": epoch_millis(self.created_at),
            "attempts": self.attempts,
            "last_error": self.last_error,
        });
        if let RetryEventKind::Retry { wait_interval } = self.kind {
            value["wait_ms"] = json!(millis(wait_interval));
        }
        value
    }
}

impl EventJson for CircuitBreakerEvent {
    fn to_json(&self) -> Value {
        let mut value = json!({
            "engine": "circuit_breaker",
            "name": &*self.name,
            "type": self.kind.label(),
            "created_at_ms": epoch_millis(self.created_at),
        });
        match &self.kind {
            CircuitBreakerEventKind::Success { elapsed } => {
                value["elapsed_ms"] = json!(millis(*elapsed));
            }
            CircuitBreakerEventKind::Error { elapsed, error }
            | CircuitBreakerEventKind::IgnoredError { elapsed, error } => {
                value["elapsed_ms"] = json!(millis(*elapsed));
                value["error"] = json!(error);
            }
            CircuitBreakerEventKind::StateTransition { from, to } => {
                value["from"] = json!(from.to_string());
                value["to"] = json!(to.to_string());
            }
            CircuitBreakerEventKind::FailureRateExceeded { failure_rate } => {
                value["failure_rate"] = json!(failure_rate);
            }
            CircuitBreakerEventKind::SlowCallRateExceeded { slow_call_rate } => {
                value["slow_call_rate"] = json!(slow_call_rate);
            }
            CircuitBreakerEventKind::CallNotPermitted | CircuitBreakerEventKind::Reset => {}
        }
        value
    }
}

impl EventJson for RateLimiterEvent {
    fn to_json(&self) -> Value {
        let permits = match self.kind {
            RateLimiterEventKind::SuccessfulAcquire { permits }
            | RateLimiterEventKind::FailedAcquire { permits }
            | RateLimiterEventKind::Drained { permits } => permits,
        };
        json!({
            "engine": "rate_limiter",
            "name": &*self.name,
            "type": self.kind.label(),
            "created_at_ms": epoch_millis(self.created_at),
            "permits": permits,
        })
    }
}
