//! Interval functions: how long a retry waits before its next attempt.
//!
//! Attempt semantics: `apply(1)` is the wait after the first failed attempt, `apply(2)` after
//! the second, and so on. `apply(0)` is the initial call and never waits.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeguard::interval::IntervalFunction;
//!
//! let f = IntervalFunction::of_exponential_backoff(Duration::from_millis(100), 2.0)
//!     .unwrap()
//!     .with_max(Duration::from_millis(500))
//!     .unwrap();
//! assert_eq!(f.apply(1), Duration::from_millis(100));
//! assert_eq!(f.apply(2), Duration::from_millis(200));
//! assert_eq!(f.apply(3), Duration::from_millis(400));
//! assert_eq!(f.apply(4), Duration::from_millis(500)); // capped
//! ```
//!
//! Computations that would overflow saturate to [`MAX_INTERVAL`] (1 day).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Upper bound for every computed interval (1 day).
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

type StepFn = dyn Fn(Duration) -> Duration + Send + Sync;
type AttemptFn = dyn Fn(usize) -> Duration + Send + Sync;

#[derive(Clone)]
enum IntervalKind {
    Constant(Duration),
    Exponential { initial: Duration, multiplier: f64, max: Option<Duration> },
    Randomized { initial: Duration, multiplier: f64, factor: f64, max: Option<Duration> },
    /// Each wait is derived from the previous one.
    Backoff { initial: Duration, step: Arc<StepFn> },
    Custom(Arc<AttemptFn>),
}

/// Maps an attempt number to the wait before the next attempt.
///
/// Closure-based forms compare by identity.
#[derive(Clone)]
pub struct IntervalFunction {
    kind: IntervalKind,
}

fn validate_initial(initial: Duration) -> Result<(), ConfigError> {
    if initial.is_zero() {
        return Err(ConfigError::InvalidInterval("initial interval must be positive".into()));
    }
    Ok(())
}

fn validate_multiplier(multiplier: f64) -> Result<(), ConfigError> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::InvalidInterval(format!(
            "multiplier must be a finite value >= 1.0 (got {})",
            multiplier
        )));
    }
    Ok(())
}

fn validate_factor(factor: f64) -> Result<(), ConfigError> {
    if !(0.0..1.0).contains(&factor) {
        return Err(ConfigError::InvalidInterval(format!(
            "randomization factor must be within [0, 1) (got {})",
            factor
        )));
    }
    Ok(())
}

fn saturate(nanos: f64) -> Duration {
    if !nanos.is_finite() || nanos >= MAX_INTERVAL.as_nanos() as f64 {
        MAX_INTERVAL
    } else if nanos <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

fn exponential(initial: Duration, multiplier: f64, attempt: usize, max: Option<Duration>) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
    let grown = saturate(initial.as_nanos() as f64 * multiplier.powi(exponent));
    max.map(|m| grown.min(m)).unwrap_or(grown)
}

impl IntervalFunction {
    /// Same wait before every retry.
    pub fn of(interval: Duration) -> Self {
        Self { kind: IntervalKind::Constant(interval) }
    }

    /// Constant [`DEFAULT_INITIAL_INTERVAL`].
    pub fn of_defaults() -> Self {
        Self::of(DEFAULT_INITIAL_INTERVAL)
    }

    /// `initial * multiplier^(attempt - 1)`.
    pub fn of_exponential_backoff(initial: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        validate_initial(initial)?;
        validate_multiplier(multiplier)?;
        Ok(Self { kind: IntervalKind::Exponential { initial, multiplier, max: None } })
    }

    /// Uniformly random within `interval ± interval * factor`.
    pub fn of_randomized(interval: Duration, factor: f64) -> Result<Self, ConfigError> {
        validate_initial(interval)?;
        validate_factor(factor)?;
        Ok(Self {
            kind: IntervalKind::Randomized { initial: interval, multiplier: 1.0, factor, max: None },
        })
    }

    /// Exponential growth with each wait randomized by `factor`.
    pub fn of_exponential_random_backoff(
        initial: Duration,
        multiplier: f64,
        factor: f64,
    ) -> Result<Self, ConfigError> {
        validate_initial(initial)?;
        validate_multiplier(multiplier)?;
        validate_factor(factor)?;
        Ok(Self { kind: IntervalKind::Randomized { initial, multiplier, factor, max: None } })
    }

    /// Starts at `initial`; every later wait is `step(previous wait)`.
    pub fn with_backoff<F>(initial: Duration, step: F) -> Self
    where
        F: Fn(Duration) -> Duration + Send + Sync + 'static,
    {
        Self { kind: IntervalKind::Backoff { initial, step: Arc::new(step) } }
    }

    /// Arbitrary attempt → wait mapping.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        Self { kind: IntervalKind::Custom(Arc::new(f)) }
    }

    /// Cap the exponential forms. Rejects a zero cap or a cap below the initial interval.
    pub fn with_max(mut self, cap: Duration) -> Result<Self, ConfigError> {
        if cap.is_zero() {
            return Err(ConfigError::InvalidInterval("max interval must be positive".into()));
        }
        match &mut self.kind {
            IntervalKind::Exponential { initial, max, .. }
            | IntervalKind::Randomized { initial, max, .. } => {
                if cap < *initial {
                    return Err(ConfigError::InvalidInterval(format!(
                        "max ({:?}) must be >= initial interval ({:?})",
                        cap, initial
                    )));
                }
                *max = Some(cap);
                Ok(self)
            }
            _ => Err(ConfigError::InvalidInterval(
                "with_max is only valid for exponential or randomized intervals".into(),
            )),
        }
    }

    /// Wait before attempt `attempt + 1`.
    pub fn apply(&self, attempt: usize) -> Duration {
        self.apply_with_rng(attempt, &mut rand::rng())
    }

    /// Like [`apply`](Self::apply) with a caller-supplied RNG for reproducible randomization.
    pub fn apply_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let wait = match &self.kind {
            IntervalKind::Constant(interval) => *interval,
            IntervalKind::Exponential { initial, multiplier, max } => {
                exponential(*initial, *multiplier, attempt, *max)
            }
            IntervalKind::Randomized { initial, multiplier, factor, max } => {
                let base = exponential(*initial, *multiplier, attempt, *max);
                let nanos = base.as_nanos() as f64;
                let delta = nanos * factor;
                let lower = saturate(nanos - delta).as_nanos() as u64;
                let upper = saturate(nanos + delta).as_nanos() as u64;
                Duration::from_nanos(rng.random_range(lower..=upper))
            }
            IntervalKind::Backoff { initial, step } => {
                (1..attempt).fold(*initial, |prev, _| step(prev).min(MAX_INTERVAL))
            }
            IntervalKind::Custom(f) => f(attempt),
        };
        wait.min(MAX_INTERVAL)
    }
}

impl Default for IntervalFunction {
    fn default() -> Self {
        Self::of_defaults()
    }
}

impl fmt::Debug for IntervalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            IntervalKind::Constant(interval) => write!(f, "Constant({:?})", interval),
            IntervalKind::Exponential { initial, multiplier, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            IntervalKind::Randomized { initial, multiplier, factor, max } => f
                .debug_struct("Randomized")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            IntervalKind::Backoff { initial, .. } => {
                f.debug_struct("Backoff").field("initial", initial).finish_non_exhaustive()
            }
            IntervalKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl PartialEq for IntervalFunction {
    fn eq(&self, other: &Self) -> bool {
        use IntervalKind::*;
        match (&self.kind, &other.kind) {
            (Constant(a), Constant(b)) => a == b,
            (
                Exponential { initial: a, multiplier: am, max: ax },
                Exponential { initial: b, multiplier: bm, max: bx },
            ) => a == b && am == bm && ax == bx,
            (
                Randomized { initial: a, multiplier: am, factor: af, max: ax },
                Randomized { initial: b, multiplier: bm, factor: bf, max: bx },
            ) => a == b && am == bm && af == bf && ax == bx,
            (Backoff { initial: a, step: sa }, Backoff { initial: b, step: sb }) => {
                a == b && Arc::ptr_eq(sa, sb)
            }
            (Custom(a), Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
