//! Named engine instances.
//!
//! A [`Registry`] maps names to engine handles. The first `get_or_create*` call for a name
//! creates the instance; later calls return that same handle and ignore their config argument.
//! Instances created without an explicit config share the registry's `"default"` config `Arc`.
//!
//! ```rust
//! use lifeguard::registry::CircuitBreakerRegistry;
//!
//! let registry = CircuitBreakerRegistry::new();
//! let a = registry.get_or_create("payments");
//! let b = registry.get_or_create("payments");
//! assert!(a.ptr_eq(&b));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ConfigError;
use crate::event::EventPublisher;
use crate::rate_limiter::RateLimiter;
use crate::retry::Retry;

/// Name of the base configuration every registry carries.
pub const DEFAULT_CONFIG_NAME: &str = "default";

/// An engine that can live in a [`Registry`].
pub trait RegistryEntry: Clone + fmt::Debug + Send + Sync + 'static {
    type Config: fmt::Debug + Send + Sync + 'static;

    fn create(name: &str, config: Arc<Self::Config>) -> Self;

    fn name(&self) -> &str;

    /// Whether both handles refer to the same underlying instance.
    fn same_instance(&self, other: &Self) -> bool;
}

/// Change to a registry's contents.
#[derive(Debug, Clone)]
pub enum RegistryEvent<T> {
    EntryAdded(T),
    EntryRemoved(T),
    EntryReplaced { old: T, new: T },
}

struct RegistryInner<T: RegistryEntry> {
    default_config: Arc<T::Config>,
    entries: RwLock<HashMap<String, T>>,
    configurations: RwLock<HashMap<String, Arc<T::Config>>>,
    events: EventPublisher<RegistryEvent<T>>,
}

/// Thread-safe map of named engines. Clones share the same map.
pub struct Registry<T: RegistryEntry> {
    inner: Arc<RegistryInner<T>>,
}

pub type RetryRegistry = Registry<Retry>;
pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
pub type RateLimiterRegistry = Registry<RateLimiter>;

impl<T: RegistryEntry> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: RegistryEntry> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.read_entries().keys().cloned().collect();
        names.sort();
        f.debug_struct("Registry").field("entries", &names).finish()
    }
}

impl<T> Registry<T>
where
    T: RegistryEntry,
    T::Config: Default,
{
    /// Registry whose base configuration is `T::Config::default()`.
    pub fn new() -> Self {
        Self::with_default_config(T::Config::default())
    }
}

impl<T> Default for Registry<T>
where
    T: RegistryEntry,
    T::Config: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RegistryEntry> Registry<T> {
    pub fn with_default_config(config: impl Into<Arc<T::Config>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                default_config: config.into(),
                entries: RwLock::new(HashMap::new()),
                configurations: RwLock::new(HashMap::new()),
                events: EventPublisher::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventPublisher<RegistryEvent<T>> {
        &self.inner.events
    }

    pub fn default_config(&self) -> Arc<T::Config> {
        self.inner.default_config.clone()
    }

    /// Store a named configuration for [`get_or_create_with_config_name`](Self::get_or_create_with_config_name).
    pub fn add_configuration(
        &self,
        name: impl Into<String>,
        config: impl Into<Arc<T::Config>>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if name == DEFAULT_CONFIG_NAME {
            return Err(ConfigError::ReservedConfigName(name));
        }
        self.inner
            .configurations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, config.into());
        Ok(())
    }

    pub fn configuration(&self, name: &str) -> Option<Arc<T::Config>> {
        if name == DEFAULT_CONFIG_NAME {
            return Some(self.default_config());
        }
        self.inner
            .configurations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Existing instance for `name`, or a new one built from the default configuration.
    pub fn get_or_create(&self, name: &str) -> T {
        self.get_or_create_with(name, self.default_config())
    }

    /// Existing instance for `name`, or a new one built from `config`.
    pub fn get_or_create_with(&self, name: &str, config: impl Into<Arc<T::Config>>) -> T {
        if let Some(existing) = self.find(name) {
            return existing;
        }
        let config = config.into();
        let (entry, created) = {
            let mut entries = self.write_entries();
            match entries.get(name) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let entry = T::create(name, config);
                    entries.insert(name.to_string(), entry.clone());
                    (entry, true)
                }
            }
        };
        if created {
            debug!(target: "lifeguard::registry", name, "registry entry created");
            self.inner.events.publish(RegistryEvent::EntryAdded(entry.clone()));
        }
        entry
    }

    /// Existing instance for `name`, or a new one built from the configuration stored as
    /// `config_name`.
    pub fn get_or_create_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<T, ConfigError> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }
        let config = self
            .configuration(config_name)
            .ok_or_else(|| ConfigError::ConfigurationNotFound(config_name.to_string()))?;
        Ok(self.get_or_create_with(name, config))
    }

    pub fn find(&self, name: &str) -> Option<T> {
        self.read_entries().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<T> {
        let removed = self.write_entries().remove(name);
        if let Some(entry) = &removed {
            debug!(target: "lifeguard::registry", name, "registry entry removed");
            self.inner.events.publish(RegistryEvent::EntryRemoved(entry.clone()));
        }
        removed
    }

    /// Swap the instance registered as `name`. Does nothing when `name` is not registered.
    /// Returns the previous instance.
    pub fn replace(&self, name: &str, new: T) -> Option<T> {
        let old = self.write_entries().get_mut(name).map(|slot| std::mem::replace(slot, new.clone()));
        if let Some(old) = &old {
            warn!(target: "lifeguard::registry", name, "registry entry replaced");
            self.inner
                .events
                .publish(RegistryEvent::EntryReplaced { old: old.clone(), new });
        }
        old
    }

    /// Every registered instance, sorted by name.
    pub fn all(&self) -> Vec<T> {
        let mut entries: Vec<(String, T)> =
            self.read_entries().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, T>> {
        self.inner.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, T>> {
        self.inner.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: RegistryEntry> EventPublisher<RegistryEvent<T>> {
    pub fn on_entry_added<F>(&self, listener: F) -> &Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let RegistryEvent::EntryAdded(entry) = event {
                listener(entry);
            }
        })
    }

    pub fn on_entry_removed<F>(&self, listener: F) -> &Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let RegistryEvent::EntryRemoved(entry) = event {
                listener(entry);
            }
        })
    }

    /// Listener receives `(old, new)`.
    pub fn on_entry_replaced<F>(&self, listener: F) -> &Self
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let RegistryEvent::EntryReplaced { old, new } = event {
                listener(old, new);
            }
        })
    }
}
