//! Cycle-based rate limiter.
//!
//! Time is split into cycles of `limit_refresh_period`, counted from the limiter's creation.
//! At every cycle boundary the available permits become
//! `min(permits + cycles_elapsed * limit_for_period, limit_for_period)`.
//!
//! A caller that finds no permit computes when one will be available. If that is within
//! `timeout_duration` it reserves the permit right away (driving the counter negative) and
//! sleeps until its cycle starts, so reservations are served in the order they were made.
//! Otherwise it waits out `timeout_duration` and is denied.
//!
//! `limit_for_period` and `timeout_duration` are live values: changes apply to the next
//! refresh and the next acquisition respectively.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeguard::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = RateLimiterConfig::builder()
//!     .limit_for_period(2)
//!     .limit_refresh_period(Duration::from_secs(1))
//!     .timeout_duration(Duration::ZERO)
//!     .build()
//!     .unwrap();
//! let limiter = RateLimiter::of("search", config);
//! assert!(limiter.acquire_permission().await);
//! assert!(limiter.acquire_permission().await);
//! assert!(!limiter.acquire_permission().await);
//! # });
//! ```

pub mod layer;

pub use layer::{RateLimiterLayer, RateLimiterService};

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::adaptive::DynamicConfig;
use crate::classifier::{CallOutcome, OutcomeMatcher};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::event::{EventPublisher, RateLimiterEvent, RateLimiterEventKind};
use crate::registry::RegistryEntry;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Validated rate limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    limit_for_period: u32,
    limit_refresh_period: Duration,
    timeout_duration: Duration,
    drain_permissions_on_result: Option<OutcomeMatcher>,
}

impl RateLimiterConfig {
    /// Every numeric field must be set before [`RateLimiterConfigBuilder::build`].
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::default()
    }

    pub fn from_base(base: &RateLimiterConfig) -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder {
            limit_for_period: Some(base.limit_for_period),
            limit_refresh_period: Some(base.limit_refresh_period),
            timeout_duration: Some(base.timeout_duration),
            drain_permissions_on_result: base.drain_permissions_on_result.clone(),
        }
    }

    pub fn limit_for_period(&self) -> u32 {
        self.limit_for_period
    }

    pub fn limit_refresh_period(&self) -> Duration {
        self.limit_refresh_period
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout_duration
    }

    pub fn drain_permissions_on_result(&self) -> Option<&OutcomeMatcher> {
        self.drain_permissions_on_result.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiterConfigBuilder {
    limit_for_period: Option<u32>,
    limit_refresh_period: Option<Duration>,
    timeout_duration: Option<Duration>,
    drain_permissions_on_result: Option<OutcomeMatcher>,
}

impl RateLimiterConfigBuilder {
    /// Permits handed out per refresh period.
    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.limit_for_period = Some(limit);
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.limit_refresh_period = Some(period);
        self
    }

    /// Longest a caller may wait for a permit. Zero fails immediately when none is left.
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.timeout_duration = Some(timeout);
        self
    }

    /// Drop the rest of the current cycle's permits when a call outcome matches.
    pub fn drain_permissions_on_result(mut self, matcher: OutcomeMatcher) -> Self {
        self.drain_permissions_on_result = Some(matcher);
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        let limit_for_period =
            self.limit_for_period.ok_or(ConfigError::MissingField("limit_for_period"))?;
        let limit_refresh_period =
            self.limit_refresh_period.ok_or(ConfigError::MissingField("limit_refresh_period"))?;
        let timeout_duration =
            self.timeout_duration.ok_or(ConfigError::MissingField("timeout_duration"))?;
        if limit_for_period == 0 {
            return Err(ConfigError::InvalidLimit(0));
        }
        if limit_refresh_period.is_zero() {
            return Err(ConfigError::InvalidRefreshPeriod(limit_refresh_period));
        }
        Ok(RateLimiterConfig {
            limit_for_period,
            limit_refresh_period,
            timeout_duration,
            drain_permissions_on_result: self.drain_permissions_on_result,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    /// Negative when callers hold reservations on future cycles.
    pub available_permissions: i64,
    pub waiting_callers: usize,
}

#[derive(Debug)]
struct LimiterState {
    active_cycle: u64,
    permissions: i64,
}

struct LimiterInner {
    name: Arc<str>,
    config: Arc<RateLimiterConfig>,
    period_nanos: u64,
    limit: DynamicConfig<u32>,
    timeout: DynamicConfig<Duration>,
    state: Mutex<LimiterState>,
    waiting: AtomicUsize,
    events: EventPublisher<RateLimiterEvent>,
}

/// Named rate limiter. Clones share permits, live settings and events.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("limit_for_period", &self.inner.limit.load())
            .field("timeout_duration", &self.inner.timeout.load())
            .finish()
    }
}

impl RateLimiter {
    pub fn of(name: impl Into<Arc<str>>, config: impl Into<Arc<RateLimiterConfig>>) -> Self {
        let config = config.into();
        let period_nanos =
            u64::try_from(config.limit_refresh_period.as_nanos()).unwrap_or(u64::MAX).max(1);
        Self {
            inner: Arc::new(LimiterInner {
                name: name.into(),
                period_nanos,
                limit: DynamicConfig::new(config.limit_for_period),
                timeout: DynamicConfig::new(config.timeout_duration),
                state: Mutex::new(LimiterState {
                    active_cycle: 0,
                    permissions: i64::from(config.limit_for_period),
                }),
                waiting: AtomicUsize::new(0),
                events: EventPublisher::new(),
                config,
            }),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Cycles are counted from the clock's zero, so swap the clock before first use.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration the limiter was built with. Live changes are not reflected here.
    pub fn config(&self) -> &Arc<RateLimiterConfig> {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.inner.events
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn limit_for_period(&self) -> u32 {
        self.inner.limit.load()
    }

    pub fn timeout_duration(&self) -> Duration {
        self.inner.timeout.load()
    }

    /// New limit, applied from the next cycle on.
    pub fn change_limit_for_period(&self, limit: u32) -> Result<(), ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidLimit(0));
        }
        self.inner.limit.set(limit);
        tracing::info!(target: "lifeguard::rate_limiter", name = %self.inner.name, limit, "limit changed");
        Ok(())
    }

    /// New timeout, applied to acquisitions that start after the change.
    pub fn change_timeout_duration(&self, timeout: Duration) {
        self.inner.timeout.set(timeout);
        tracing::info!(
            target: "lifeguard::rate_limiter",
            name = %self.inner.name,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "timeout changed"
        );
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let now = self.clock.now_nanos();
        let available_permissions = {
            let mut state = self.lock();
            self.refresh(&mut state, now);
            state.permissions
        };
        RateLimiterMetrics {
            available_permissions,
            waiting_callers: self.inner.waiting.load(Ordering::Relaxed),
        }
    }

    pub async fn acquire_permission(&self) -> bool {
        self.acquire_permissions(1).await
    }

    /// Take `permits` permits, waiting up to the timeout for them.
    ///
    /// Returns `false` after waiting the full timeout when the permits would not be available
    /// in time. Requests larger than `limit_for_period` are denied at once.
    pub async fn acquire_permissions(&self, permits: u32) -> bool {
        let timeout = self.inner.timeout.load();
        match self.try_reserve(permits, timeout) {
            Some(reservation) if reservation.wait.is_zero() => {
                self.publish(RateLimiterEventKind::SuccessfulAcquire { permits });
                true
            }
            Some(reservation) => {
                let _waiting = WaitingGuard::enter(&self.inner.waiting);
                let mut pending = PendingReservation { limiter: self, reservation, armed: true };
                self.sleeper.sleep(reservation.wait).await;
                pending.armed = false;
                self.publish(RateLimiterEventKind::SuccessfulAcquire { permits });
                true
            }
            None => {
                if permits <= self.inner.limit.load() && !timeout.is_zero() {
                    let _waiting = WaitingGuard::enter(&self.inner.waiting);
                    self.sleeper.sleep(timeout).await;
                }
                tracing::debug!(
                    target: "lifeguard::rate_limiter",
                    name = %self.inner.name,
                    permits,
                    "request not permitted"
                );
                self.publish(RateLimiterEventKind::FailedAcquire { permits });
                false
            }
        }
    }

    /// Reserve one permit without waiting. Returns how long the caller must wait before using
    /// it, or `None` when it would not be available within the timeout.
    pub fn reserve_permission(&self) -> Option<Duration> {
        let reserved = self.try_reserve(1, self.inner.timeout.load()).map(|r| r.wait);
        let kind = match reserved {
            Some(_) => RateLimiterEventKind::SuccessfulAcquire { permits: 1 },
            None => RateLimiterEventKind::FailedAcquire { permits: 1 },
        };
        self.publish(kind);
        reserved
    }

    /// Drop the permits left in the current cycle. Reservations on later cycles are kept.
    ///
    /// `Drained` is only published when there was something left to drop.
    pub fn drain_permissions(&self) {
        let now = self.clock.now_nanos();
        let drained = {
            let mut state = self.lock();
            self.refresh(&mut state, now);
            let left = state.permissions.max(0);
            state.permissions = state.permissions.min(0);
            left
        };
        if drained == 0 {
            return;
        }
        tracing::debug!(target: "lifeguard::rate_limiter", name = %self.inner.name, drained, "permissions drained");
        let permits = u32::try_from(drained).unwrap_or(u32::MAX);
        self.publish(RateLimiterEventKind::Drained { permits });
    }

    /// Execute an async operation once a permit is acquired.
    ///
    /// # Errors
    /// Returns `ResilienceError::RequestNotPermitted` when no permit was available within the
    /// timeout, otherwise whatever the operation returned.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        if !self.acquire_permission().await {
            return Err(ResilienceError::RequestNotPermitted {
                name: self.inner.name.clone(),
                timeout: self.inner.timeout.load(),
            });
        }
        let result = operation().await;
        self.drain_if_matched(&result);
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
        let limiter = self.clone();
        let f = Arc::new(f);
        move |arg: A| {
            let limiter = limiter.clone();
            let f = f.clone();
            let fut: BoxFuture<'static, Result<T, ResilienceError<E>>> =
                Box::pin(async move { limiter.execute(|| f(arg)).await });
            fut
        }
    }

    pub fn layer(&self) -> RateLimiterLayer {
        RateLimiterLayer::new(self.clone())
    }

    fn drain_if_matched<T, E>(&self, result: &Result<T, ResilienceError<E>>)
    where
        T: 'static,
        E: Error + 'static,
    {
        let Some(matcher) = &self.inner.config.drain_permissions_on_result else {
            return;
        };
        let outcome = match result {
            Ok(value) => CallOutcome::Value(value),
            Err(ResilienceError::Inner(e)) => CallOutcome::Error(e),
            Err(other) => CallOutcome::Error(other),
        };
        if matcher.matches(&outcome) {
            self.drain_permissions();
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh(&self, state: &mut LimiterState, now_nanos: u64) {
        let cycle = now_nanos / self.inner.period_nanos;
        if cycle <= state.active_cycle {
            return;
        }
        let limit = i64::from(self.inner.limit.load());
        let elapsed = i64::try_from(cycle - state.active_cycle).unwrap_or(i64::MAX);
        state.permissions = state.permissions.saturating_add(elapsed.saturating_mul(limit)).min(limit);
        state.active_cycle = cycle;
    }

    /// Nanoseconds until `permits` permits are available, given the refreshed state.
    fn nanos_to_wait(&self, state: &LimiterState, permits: i64, now_nanos: u64) -> u64 {
        if state.permissions >= permits {
            return 0;
        }
        let period = self.inner.period_nanos;
        let limit = i64::from(self.inner.limit.load());
        let next_cycle_start = (state.active_cycle + 1).saturating_mul(period);
        let to_next_cycle = next_cycle_start.saturating_sub(now_nanos);
        let missing_after_next = permits - (state.permissions + limit);
        let full_cycles = if missing_after_next > 0 {
            u64::try_from((missing_after_next + limit - 1) / limit).unwrap_or(u64::MAX)
        } else {
            0
        };
        full_cycles.saturating_mul(period).saturating_add(to_next_cycle)
    }

    /// Reserve `permits` when they are available within `timeout`.
    fn try_reserve(&self, permits: u32, timeout: Duration) -> Option<Reservation> {
        if permits > self.inner.limit.load() {
            return None;
        }
        let now = self.clock.now_nanos();
        let permits = i64::from(permits);
        let mut state = self.lock();
        self.refresh(&mut state, now);
        let wait_nanos = self.nanos_to_wait(&state, permits, now);
        let wait = Duration::from_nanos(wait_nanos);
        if wait <= timeout {
            state.permissions -= permits;
            let cycle = now.saturating_add(wait_nanos) / self.inner.period_nanos;
            Some(Reservation { permits, wait, cycle })
        } else {
            None
        }
    }

    /// Hand back a reservation whose cycle has not started yet.
    fn cancel(&self, reservation: Reservation) {
        let now = self.clock.now_nanos();
        let returned = {
            let mut state = self.lock();
            self.refresh(&mut state, now);
            if state.active_cycle >= reservation.cycle {
                false
            } else {
                let limit = i64::from(self.inner.limit.load());
                state.permissions = (state.permissions + reservation.permits).min(limit);
                true
            }
        };
        if returned {
            tracing::debug!(
                target: "lifeguard::rate_limiter",
                name = %self.inner.name,
                permits = reservation.permits,
                "cancelled reservation returned"
            );
        }
    }

    fn publish(&self, kind: RateLimiterEventKind) {
        self.inner.events.publish(RateLimiterEvent::new(self.inner.name.clone(), kind));
    }
}

/// Permits taken from the counter ahead of the cycle that funds them.
#[derive(Debug, Clone, Copy)]
struct Reservation {
    permits: i64,
    wait: Duration,
    /// Cycle in which the permits become usable.
    cycle: u64,
}

/// Returns the reservation when the waiting future is dropped before it wakes up.
struct PendingReservation<'a> {
    limiter: &'a RateLimiter,
    reservation: Reservation,
    armed: bool,
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.cancel(self.reservation);
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RegistryEntry for RateLimiter {
    type Config = RateLimiterConfig;

    fn create(name: &str, config: Arc<RateLimiterConfig>) -> Self {
        RateLimiter::of(name, config)
    }

    fn name(&self) -> &str {
        RateLimiter::name(self)
    }

    fn same_instance(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl EventPublisher<RateLimiterEvent> {
    pub fn on_success<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.on_filtered(
            |e| matches!(e.kind, RateLimiterEventKind::SuccessfulAcquire { .. }),
            listener,
        )
    }

    pub fn on_failure<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| matches!(e.kind, RateLimiterEventKind::FailedAcquire { .. }), listener)
    }

    pub fn on_drained<F>(&self, listener: F) -> &Self
    where
        F: Fn(&RateLimiterEvent) + Send + Sync + 'static,
    {
        self.on_filtered(|e| matches!(e.kind, RateLimiterEventKind::Drained { .. }), listener)
    }
}
