//! Circuit breaker driven by a sliding window of call outcomes.
//!
//! States:
//! - **Closed** (initial): every outcome is recorded. Once the window holds at least
//!   `minimum_number_of_calls` outcomes (capped by the window size for count-based windows),
//!   the failure rate and slow-call rate are evaluated after each call; reaching either
//!   threshold opens the circuit.
//! - **Open**: calls are rejected with `ResilienceError::CallNotPermitted` without invoking the
//!   operation. After `wait_duration_in_open_state` the circuit moves to half-open: on a timer
//!   when `automatic_transition_from_open_to_half_open` is set, otherwise on the next call.
//! - **HalfOpen**: admits `permitted_number_of_calls_in_half_open_state` trial calls into a fresh
//!   window. Once they are all recorded the circuit closes when both rates are below threshold
//!   and reopens otherwise. A nonzero `max_wait_duration_in_half_open_state` reopens the circuit
//!   when the trial calls take too long to complete.
//!
//! Window and state bookkeeping happen under one `Mutex` that is never held across an
//! `.await`. Events are published after the lock is released.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeguard::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use lifeguard::ResilienceError;
//!
//! # #[derive(Debug)] struct Boom;
//! # impl std::fmt::Display for Boom { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "boom") } }
//! # impl std::error::Error for Boom {}
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = CircuitBreakerConfig::builder()
//!     .sliding_window_size(4)
//!     .minimum_number_of_calls(4)
//!     .failure_rate_threshold(50.0)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .build()
//!     .unwrap();
//! let breaker = CircuitBreaker::of("inventory", config);
//! for _ in 0..4 {
//!     let _ = breaker.execute(|| async { Err::<(), _>(ResilienceError::Inner(Boom)) }).await;
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! # });
//! ```

pub mod layer;
pub mod sliding_window;

pub use layer::{CircuitBreakerLayer, CircuitBreakerService};
pub use sliding_window::{Outcome, SlidingWindow, Snapshot};

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::classifier::{Classification, ErrorClassifier, ErrorMatcher, ResultMatcher};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::event::{CircuitBreakerEvent, CircuitBreakerEventKind, EventPublisher};
use crate::registry::RegistryEntry;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation; outcomes are recorded.
    Closed,
    /// Rejecting calls until the open wait elapses.
    Open,
    /// Admitting a bounded number of trial calls.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlidingWindowType {
    /// `sliding_window_size` is a number of calls.
    #[default]
    CountBased,
    /// `sliding_window_size` is a number of seconds.
    TimeBased,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_rate_threshold: f32,
    slow_call_rate_threshold: f32,
    slow_call_duration_threshold: Duration,
    sliding_window_type: SlidingWindowType,
    sliding_window_size: u32,
    minimum_number_of_calls: u32,
    wait_duration_in_open_state: Duration,
    automatic_transition_from_open_to_half_open: bool,
    permitted_number_of_calls_in_half_open_state: u32,
    max_wait_duration_in_half_open_state: Duration,
    classifier: ErrorClassifier,
    record_result: Option<ResultMatcher>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            automatic_transition_from_open_to_half_open: false,
            permitted_number_of_calls_in_half_open_state: 10,
            max_wait_duration_in_half_open_state: Duration::ZERO,
            classifier: ErrorClassifier::default(),
            record_result: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// Builder pre-populated with every setting of `base`.
    pub fn from_base(base: &CircuitBreakerConfig) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: base.clone() }
    }

    pub fn failure_rate_threshold(&self) -> f32 {
        self.failure_rate_threshold
    }

    pub fn slow_call_rate_threshold(&self) -> f32 {
        self.slow_call_rate_threshold
    }

    pub fn slow_call_duration_threshold(&self) -> Duration {
        self.slow_call_duration_threshold
    }

    pub fn sliding_window_type(&self) -> SlidingWindowType {
        self.sliding_window_type
    }

    pub fn sliding_window_size(&self) -> u32 {
        self.sliding_window_size
    }

    pub fn minimum_number_of_calls(&self) -> u32 {
        self.minimum_number_of_calls
    }

    pub fn wait_duration_in_open_state(&self) -> Duration {
        self.wait_duration_in_open_state
    }

    pub fn automatic_transition_from_open_to_half_open(&self) -> bool {
        self.automatic_transition_from_open_to_half_open
    }

    pub fn permitted_number_of_calls_in_half_open_state(&self) -> u32 {
        self.permitted_number_of_calls_in_half_open_state
    }

    pub fn max_wait_duration_in_half_open_state(&self) -> Duration {
        self.max_wait_duration_in_half_open_state
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Calls needed in the closed window before rates are evaluated.
    fn closed_minimum(&self) -> u32 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                self.minimum_number_of_calls.min(self.sliding_window_size)
            }
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }

    fn closed_window(&self) -> SlidingWindow {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => SlidingWindow::count(self.sliding_window_size),
            SlidingWindowType::TimeBased => SlidingWindow::time(self.sliding_window_size),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Percentage of failed calls at which the circuit opens.
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Percentage of slow calls at which the circuit opens.
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls taking at least this long count as slow.
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    pub fn sliding_window_size(mut self, size: u32) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Shorthand for a window type and size together.
    pub fn sliding_window(mut self, window_type: SlidingWindowType, size: u32) -> Self {
        self.config.sliding_window_type = window_type;
        self.config.sliding_window_size = size;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Zero waits indefinitely for the trial calls.
    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = wait;
        self
    }

    /// Count errors accepted by `matcher` as failures. Without any rule every error counts.
    /// Errors that match no rule are recorded as successes.
    pub fn record_on(mut self, matcher: ErrorMatcher) -> Self {
        self.config.classifier = self.config.classifier.with_match(matcher);
        self
    }

    pub fn record_error<T: Error + 'static>(self) -> Self {
        self.record_on(ErrorMatcher::of::<T>())
    }

    /// Errors accepted by `matcher` are neither failures nor successes.
    pub fn ignore_on(mut self, matcher: ErrorMatcher) -> Self {
        self.config.classifier = self.config.classifier.with_ignore(matcher);
        self
    }

    pub fn ignore_error<T: Error + 'static>(self) -> Self {
        self.ignore_on(ErrorMatcher::of::<T>())
    }

    /// Record successful calls whose value is accepted by `matcher` as failures.
    pub fn record_result(mut self, matcher: ResultMatcher) -> Self {
        self.config.record_result = Some(matcher);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        let c = &self.config;
        for (name, value) in [
            ("failure_rate_threshold", c.failure_rate_threshold),
            ("slow_call_rate_threshold", c.slow_call_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        if c.sliding_window_size == 0 {
            return Err(ConfigError::InvalidWindowSize(0));
        }
        if c.minimum_number_of_calls == 0 {
            return Err(ConfigError::InvalidMinimumCalls(0));
        }
        if c.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::InvalidHalfOpenCalls(0));
        }
        if c.wait_duration_in_open_state.is_zero() {
            return Err(ConfigError::InvalidWaitDuration {
                name: "wait_duration_in_open_state",
                value: c.wait_duration_in_open_state,
            });
        }
        if c.slow_call_duration_threshold.is_zero() {
            return Err(ConfigError::InvalidWaitDuration {
                name: "slow_call_duration_threshold",
                value: c.slow_call_duration_threshold,
            });
        }
        Ok(self.config)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// `None` until the window holds enough calls to be evaluated.
    pub failure_rate: Option<f32>,
    pub slow_call_rate: Option<f32>,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub successful_calls: u32,
    pub not_permitted_calls: u64,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    entered_at_millis: u64,
    window: SlidingWindow,
    half_open_permits: u32,
    /// Bumped on every state change so late completions from an earlier state are dropped.
    generation: u64,
}

struct BreakerInner {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    core: Mutex<BreakerCore>,
    events: EventPublisher<CircuitBreakerEvent>,
    not_permitted: AtomicU64,
}

enum Disposition {
    Success,
    Failure(String),
    Ignored(String),
}

type Pending = Vec<CircuitBreakerEventKind>;

/// Named circuit breaker. Clones share state, events and metrics.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.lock().state)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn of(name: impl Into<Arc<str>>, config: impl Into<Arc<CircuitBreakerConfig>>) -> Self {
        let config = config.into();
        let core = BreakerCore {
            state: CircuitState::Closed,
            entered_at_millis: 0,
            window: config.closed_window(),
            half_open_permits: 0,
            generation: 0,
        };
        Self {
            inner: Arc::new(BreakerInner {
                name: name.into(),
                config,
                core: Mutex::new(core),
                events: EventPublisher::new(),
                not_permitted: AtomicU64::new(0),
            }),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn of_defaults(name: impl Into<Arc<str>>) -> Self {
        Self::of(name, CircuitBreakerConfig::default())
    }

    /// Override the clock used for open/half-open timing and call durations.
    ///
    /// ```rust
    /// use lifeguard::circuit_breaker::CircuitBreaker;
    /// use lifeguard::clock::ManualClock;
    ///
    /// let clock = ManualClock::new();
    /// let breaker = CircuitBreaker::of_defaults("db").with_clock(clock.clone());
    /// # let _ = breaker;
    /// ```
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &Arc<CircuitBreakerConfig> {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.inner.events
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current state. Applies any timed transition that is due.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let mut pending = Pending::new();
        let state = {
            let mut core = self.lock();
            self.advance_timers(&mut core, now, false, &mut pending);
            core.state
        };
        self.publish_all(pending);
        state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state();
        let now = self.clock.now_millis();
        let core = self.lock();
        let snapshot = core.window.snapshot(now);
        let minimum = match core.state {
            CircuitState::HalfOpen => self.inner.config.permitted_number_of_calls_in_half_open_state,
            _ => self.inner.config.closed_minimum(),
        };
        let evaluated = snapshot.total_calls >= minimum;
        CircuitBreakerMetrics {
            state,
            failure_rate: evaluated.then(|| snapshot.failure_rate()),
            slow_call_rate: evaluated.then(|| snapshot.slow_call_rate()),
            buffered_calls: snapshot.total_calls,
            failed_calls: snapshot.failed_calls,
            slow_calls: snapshot.slow_calls,
            successful_calls: snapshot.successful_calls(),
            not_permitted_calls: self.inner.not_permitted.load(Ordering::Relaxed),
        }
    }

    /// Acquire a permit for one call, or `None` if the breaker rejects it.
    ///
    /// The permit must be completed with one of its `record_*` methods; dropping it unrecorded
    /// releases a half-open trial slot without recording anything.
    pub fn try_acquire_permission(&self) -> Option<CallPermit> {
        self.acquire().ok()
    }

    /// Execute an async operation under the breaker.
    ///
    /// # Errors
    /// Returns `ResilienceError::CallNotPermitted` when the breaker rejects the call, otherwise
    /// whatever the operation returned.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let permit = match self.acquire() {
            Ok(permit) => permit,
            Err(state) => {
                return Err(ResilienceError::CallNotPermitted { name: self.inner.name.clone(), state })
            }
        };

        let result = operation().await;

        match &result {
            Ok(value) => match &self.inner.config.record_result {
                Some(matcher) if matcher.matches(value) => {
                    permit.complete(Disposition::Failure("result recorded as failure".into()))
                }
                _ => permit.record_success(),
            },
            Err(ResilienceError::Inner(e)) => permit.record_error(e),
            Err(rejection) => permit.record_error(rejection),
        }
        result
    }

    /// Wrap `f` so every invocation runs through [`execute`](Self::execute).
    pub fn decorate<A, T, E, F, Fut>(
        &self,
        f: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync
    where
        A: Send + 'static,
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        let breaker = self.clone();
        let f = Arc::new(f);
        move |arg: A| {
            let breaker = breaker.clone();
            let f = f.clone();
            let fut: BoxFuture<'static, Result<T, ResilienceError<E>>> =
                Box::pin(async move { breaker.execute(|| f(arg)).await });
            fut
        }
    }

    /// Tower layer applying this breaker to a service.
    pub fn layer(&self) -> CircuitBreakerLayer {
        CircuitBreakerLayer::new(self.clone())
    }

    pub fn transition_to_closed_state(&self) {
        self.manual_transition(CircuitState::Closed);
    }

    pub fn transition_to_open_state(&self) {
        self.manual_transition(CircuitState::Open);
    }

    pub fn transition_to_half_open_state(&self) {
        self.manual_transition(CircuitState::HalfOpen);
    }

    /// Back to Closed with an empty window.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut pending = Pending::new();
        {
            let mut core = self.lock();
            if core.state == CircuitState::Closed {
                core.window = self.inner.config.closed_window();
                core.generation += 1;
                core.entered_at_millis = now;
            } else {
                self.transition(&mut core, CircuitState::Closed, now, &mut pending);
            }
        }
        tracing::info!(target: "lifeguard::circuit_breaker", name = %self.inner.name, "circuit breaker reset");
        pending.push(CircuitBreakerEventKind::Reset);
        self.publish_all(pending);
    }

    fn manual_transition(&self, to: CircuitState) {
        let now = self.clock.now_millis();
        let mut pending = Pending::new();
        {
            let mut core = self.lock();
            self.transition(&mut core, to, now, &mut pending);
        }
        self.publish_all(pending);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<CallPermit, CircuitState> {
        let now = self.clock.now_millis();
        let mut pending = Pending::new();
        let decision = {
            let mut core = self.lock();
            self.advance_timers(&mut core, now, true, &mut pending);
            match core.state {
                CircuitState::Closed => Ok((false, core.generation)),
                CircuitState::HalfOpen if core.half_open_permits > 0 => {
                    core.half_open_permits -= 1;
                    Ok((true, core.generation))
                }
                state => Err(state),
            }
        };
        let result = match decision {
            Ok((half_open, generation)) => Ok(CallPermit {
                breaker: self.clone(),
                half_open,
                generation,
                started_nanos: self.clock.now_nanos(),
                completed: false,
            }),
            Err(state) => {
                self.inner.not_permitted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "lifeguard::circuit_breaker",
                    name = %self.inner.name,
                    %state,
                    "call not permitted"
                );
                pending.push(CircuitBreakerEventKind::CallNotPermitted);
                Err(state)
            }
        };
        self.publish_all(pending);
        result
    }

    fn advance_timers(&self, core: &mut BreakerCore, now: u64, on_call: bool, pending: &mut Pending) {
        let config = &self.inner.config;
        if core.state == CircuitState::Open
            && (on_call || config.automatic_transition_from_open_to_half_open)
            && now.saturating_sub(core.entered_at_millis) >= millis(config.wait_duration_in_open_state)
        {
            self.transition(core, CircuitState::HalfOpen, now, pending);
        }
        let max_wait = config.max_wait_duration_in_half_open_state;
        if core.state == CircuitState::HalfOpen
            && !max_wait.is_zero()
            && now.saturating_sub(core.entered_at_millis) >= millis(max_wait)
        {
            self.transition(core, CircuitState::Open, now, pending);
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: CircuitState, now: u64, pending: &mut Pending) {
        let from = core.state;
        if from == to {
            return;
        }
        let config = &self.inner.config;
        core.state = to;
        core.entered_at_millis = now;
        core.generation += 1;
        core.window = match to {
            CircuitState::HalfOpen => {
                SlidingWindow::count(config.permitted_number_of_calls_in_half_open_state)
            }
            _ => config.closed_window(),
        };
        core.half_open_permits = match to {
            CircuitState::HalfOpen => config.permitted_number_of_calls_in_half_open_state,
            _ => 0,
        };

        match to {
            CircuitState::Open => tracing::warn!(
                target: "lifeguard::circuit_breaker",
                name = %self.inner.name,
                %from,
                "circuit breaker opened"
            ),
            _ => tracing::info!(
                target: "lifeguard::circuit_breaker",
                name = %self.inner.name,
                %from,
                %to,
                "circuit breaker state change"
            ),
        }
        pending.push(CircuitBreakerEventKind::StateTransition { from, to });

        match to {
            CircuitState::Open if config.automatic_transition_from_open_to_half_open => {
                self.schedule_check(config.wait_duration_in_open_state);
            }
            CircuitState::HalfOpen if !config.max_wait_duration_in_half_open_state.is_zero() => {
                self.schedule_check(config.max_wait_duration_in_half_open_state);
            }
            _ => {}
        }
    }

    /// Re-check timed transitions after `after`, if a tokio runtime is available.
    /// Without one, transitions still happen lazily on `state()` and on the next call.
    fn schedule_check(&self, after: Duration) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<BreakerInner> = Arc::downgrade(&self.inner);
        let clock = self.clock.clone();
        handle.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                CircuitBreaker { inner, clock }.state();
            }
        });
    }

    fn disposition_for_error(&self, err: &(dyn Error + 'static)) -> Disposition {
        match self.inner.config.classifier.classify(err) {
            Classification::Ignore => Disposition::Ignored(err.to_string()),
            Classification::Retry => Disposition::Failure(err.to_string()),
            Classification::Fail => Disposition::Success,
        }
    }

    fn on_complete(&self, permit: &CallPermit, disposition: Disposition) {
        let now_nanos = self.clock.now_nanos();
        let now = now_nanos / 1_000_000;
        let elapsed = Duration::from_nanos(now_nanos.saturating_sub(permit.started_nanos));
        let mut pending = Pending::new();
        {
            let mut core = self.lock();
            let current = core.generation == permit.generation;
            let failed = match disposition {
                Disposition::Ignored(error) => {
                    if current && permit.half_open {
                        core.half_open_permits += 1;
                    }
                    pending.push(CircuitBreakerEventKind::IgnoredError { elapsed, error });
                    None
                }
                Disposition::Success => {
                    pending.push(CircuitBreakerEventKind::Success { elapsed });
                    Some(false)
                }
                Disposition::Failure(error) => {
                    pending.push(CircuitBreakerEventKind::Error { elapsed, error });
                    Some(true)
                }
            };
            if let (Some(failed), true) = (failed, current) {
                let slow = elapsed >= self.inner.config.slow_call_duration_threshold;
                let snapshot = core.window.record(Outcome::from_call(failed, slow), elapsed, now);
                self.evaluate(&mut core, snapshot, now, &mut pending);
            }
        }
        self.publish_all(pending);
    }

    fn evaluate(&self, core: &mut BreakerCore, snapshot: Snapshot, now: u64, pending: &mut Pending) {
        let config = &self.inner.config;
        match core.state {
            CircuitState::Closed => {
                if snapshot.total_calls < config.closed_minimum() {
                    return;
                }
                if let Some(exceeded) = self.threshold_exceeded(&snapshot) {
                    pending.push(exceeded);
                    self.transition(core, CircuitState::Open, now, pending);
                }
            }
            CircuitState::HalfOpen => {
                if snapshot.total_calls < config.permitted_number_of_calls_in_half_open_state {
                    return;
                }
                match self.threshold_exceeded(&snapshot) {
                    Some(exceeded) => {
                        pending.push(exceeded);
                        self.transition(core, CircuitState::Open, now, pending);
                    }
                    None => self.transition(core, CircuitState::Closed, now, pending),
                }
            }
            CircuitState::Open => {}
        }
    }

    fn threshold_exceeded(&self, snapshot: &Snapshot) -> Option<CircuitBreakerEventKind> {
        let config = &self.inner.config;
        let failure_rate = snapshot.failure_rate();
        if failure_rate >= config.failure_rate_threshold {
            return Some(CircuitBreakerEventKind::FailureRateExceeded { failure_rate });
        }
        let slow_call_rate = snapshot.slow_call_rate();
        if slow_call_rate >= config.slow_call_rate_threshold {
            return Some(CircuitBreakerEventKind::SlowCallRateExceeded { slow_call_rate });
        }
        None
    }

    fn release(&self, permit: &CallPermit) {
        if !permit.half_open {
            return;
        }
        let mut core = self.lock();
        if core.generation == permit.generation {
            core.half_open_permits += 1;
        }
    }

    fn publish_all(&self, pending: Pending) {
        for kind in pending {
            self.inner.events.publish(CircuitBreakerEvent::new(self.inner.name.clone(), kind));
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Permission to run one call through a [`CircuitBreaker`].
///
/// Dropping the permit without recording (for example when the call's future is cancelled)
/// gives a half-open trial slot back.
#[must_use = "a permit must be completed with record_success or record_error"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    half_open: bool,
    generation: u64,
    started_nanos: u64,
    completed: bool,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.inner.name)
            .field("half_open", &self.half_open)
            .finish()
    }
}

impl CallPermit {
    pub fn record_success(self) {
        self.complete(Disposition::Success);
    }

    /// Record a failed call. The breaker's `record_on`/`ignore_on` rules decide how it counts.
    pub fn record_error(self, err: &(dyn Error + 'static)) {
        let disposition = self.breaker.disposition_for_error(err);
        self.complete(disposition);
    }

    fn complete(mut self, disposition: Disposition) {
        self.completed = true;
        let breaker = self.breaker.clone();
        breaker.on_complete(&self, disposition);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release(self);
        }
    }
}

impl RegistryEntry for CircuitBreaker {
    type Config = CircuitBreakerConfig;

    fn create(name: &str, config: Arc<CircuitBreakerConfig>) -> Self {
        CircuitBreaker::of(name, config)
    }

    fn name(&self) -> &str {
        CircuitBreaker::name(self)
    }

    fn same_instance(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl EventPublisher<CircuitBreakerEvent> {
    pub fn on_state_transition<F>(&self, listener: F) -> &Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.on_filtered(
            |e| matches!(e.kind, CircuitBreakerEventKind::StateTransition { .. }),
            listener,
        )
    }

    pub fn on_success<F>(&self, listener: F) -> &Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| matches!(e.kind, CircuitBreakerEventKind::Success { .. }), listener)
    }

    pub fn on_error<F>(&self, listener: F) -> &Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| matches!(e.kind, CircuitBreakerEventKind::Error { .. }), listener)
    }

    pub fn on_ignored_error<F>(&self, listener: F) -> &Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.on_filtered(
            |e| matches!(e.kind, CircuitBreakerEventKind::IgnoredError { .. }),
            listener,
        )
    }

    pub fn on_call_not_permitted<F>(&self, listener: F) -> &Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| e.kind == CircuitBreakerEventKind::CallNotPermitted, listener)
    }

    pub fn on_reset<F>(&self, listener: F) -> &Self
    where
        F: Fn(&CircuitBreakerEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| e.kind == CircuitBreakerEventKind::Reset, listener)
    }
}
