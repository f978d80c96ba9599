//! Event plumbing shared by every engine and registry.
//!
//! Each engine owns an [`EventPublisher`] for its event type. Consumers either register
//! synchronous listeners (`on_event` and the typed helpers each engine adds, such as
//! `on_retry` or `on_state_transition`) or take an async stream with [`EventPublisher::subscribe`].
//!
//! Listeners run on the caller's task right after the engine has updated its state and
//! released its lock, in registration order. A panicking listener is logged and skipped;
//! the remaining listeners still run.
//!
//! ```rust
//! use lifeguard::retry::{Retry, RetryConfig};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let retry = Retry::of("backend", RetryConfig::default());
//! let retries = Arc::new(AtomicUsize::new(0));
//! let seen = retries.clone();
//! retry.events().on_retry(move |_event| {
//!     seen.fetch_add(1, Ordering::SeqCst);
//! });
//! assert_eq!(retries.load(Ordering::SeqCst), 0);
//! ```

mod kinds;

#[cfg(feature = "telemetry-json")]
pub mod json;

pub use kinds::{
    CircuitBreakerEvent, CircuitBreakerEventKind, RateLimiterEvent, RateLimiterEventKind,
    RetryEvent, RetryEventKind,
};

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

/// Capacity of the broadcast stream handed out by [`EventPublisher::subscribe`].
///
/// Subscribers that fall further behind observe `RecvError::Lagged`.
pub const EVENT_STREAM_CAPACITY: usize = 256;

type Listener<Ev> = Arc<dyn Fn(&Ev) + Send + Sync>;

/// Observer list plus a broadcast stream for one engine's events.
///
/// Clones share listeners and the stream.
pub struct EventPublisher<Ev> {
    listeners: Arc<RwLock<Vec<Listener<Ev>>>>,
    stream: broadcast::Sender<Ev>,
}

impl<Ev> Clone for EventPublisher<Ev> {
    fn clone(&self) -> Self {
        Self { listeners: self.listeners.clone(), stream: self.stream.clone() }
    }
}

impl<Ev> fmt::Debug for EventPublisher<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.stream.receiver_count())
            .finish()
    }
}

impl<Ev> Default for EventPublisher<Ev>
where
    Ev: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Ev> EventPublisher<Ev> {
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when at least one listener or subscriber would observe a published event.
    pub fn has_consumers(&self) -> bool {
        self.listener_count() > 0 || self.stream.receiver_count() > 0
    }
}

impl<Ev> EventPublisher<Ev>
where
    Ev: Clone + fmt::Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Self { listeners: Arc::new(RwLock::new(Vec::new())), stream }
    }

    /// Register a listener for every event.
    pub fn on_event<F>(&self, listener: F) -> &Self
    where
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(Arc::new(listener));
        self
    }

    /// Register a listener that only sees events accepted by `filter`.
    pub fn on_filtered<P, F>(&self, filter: P, listener: F) -> &Self
    where
        P: Fn(&Ev) -> bool + Send + Sync + 'static,
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if filter(event) {
                listener(event);
            }
        })
    }

    /// Receive events asynchronously. Only events published after subscribing are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Ev> {
        self.stream.subscribe()
    }

    pub(crate) fn publish(&self, event: Ev) {
        tracing::trace!(target: "lifeguard::event", ?event, "publishing event");
        // Snapshot so listeners may register further listeners without deadlocking.
        let listeners: Vec<Listener<Ev>> =
            self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(
                    target: "lifeguard::event",
                    ?event,
                    "event listener panicked; skipping it"
                );
            }
        }
        if self.stream.receiver_count() > 0 {
            let _ = self.stream.send(event);
        }
    }
}
