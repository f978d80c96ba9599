mod common;

use common::Recorded;
use lifeguard::registry::{CircuitBreakerRegistry, RateLimiterRegistry, RetryRegistry};
use lifeguard::{CircuitBreaker, CircuitBreakerConfig, RateLimiterConfig, RegistryEntry, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn first_writer_wins() {
    let registry = RetryRegistry::new();
    let first = registry.get_or_create_with(
        "backend",
        RetryConfig::builder().max_attempts(7).build().unwrap(),
    );
    let second = registry.get_or_create_with(
        "backend",
        RetryConfig::builder().max_attempts(2).build().unwrap(),
    );

    assert!(first.ptr_eq(&second));
    assert_eq!(second.config().max_attempts(), 7);
}

#[test]
fn distinct_names_get_distinct_instances() {
    let registry = CircuitBreakerRegistry::new();
    let a = registry.get_or_create("a");
    let b = registry.get_or_create("b");
    assert!(!a.ptr_eq(&b));
    assert_eq!(registry.len(), 2);
}

#[test]
fn instances_share_the_default_config() {
    let base = Arc::new(
        CircuitBreakerConfig::builder().failure_rate_threshold(25.0).build().unwrap(),
    );
    let registry = CircuitBreakerRegistry::with_default_config(base.clone());

    let a = registry.get_or_create("a");
    let b = registry.get_or_create("b");
    assert!(Arc::ptr_eq(a.config(), &base));
    assert!(Arc::ptr_eq(b.config(), &base));

    let explicit = Arc::new(CircuitBreakerConfig::default());
    let c = registry.get_or_create_with("c", explicit.clone());
    assert!(Arc::ptr_eq(c.config(), &explicit));
}

#[test]
fn rate_limiter_registry_needs_an_explicit_base() {
    let base = RateLimiterConfig::builder()
        .limit_for_period(10)
        .limit_refresh_period(Duration::from_secs(1))
        .timeout_duration(Duration::ZERO)
        .build()
        .unwrap();
    let registry = RateLimiterRegistry::with_default_config(base);
    let limiter = registry.get_or_create("search");
    assert_eq!(limiter.limit_for_period(), 10);
    assert_eq!(RegistryEntry::name(&limiter), "search");
}

#[test]
fn lifecycle_events_are_published() {
    let registry = CircuitBreakerRegistry::new();
    let added = Recorded::new();
    let removed = Recorded::new();
    let replaced = Recorded::new();
    let (a, r, p) = (added.clone(), removed.clone(), replaced.clone());
    registry
        .events()
        .on_entry_added(move |cb| a.push(cb.name().to_string()))
        .on_entry_removed(move |cb| r.push(cb.name().to_string()))
        .on_entry_replaced(move |old, new| p.push((old.name().to_string(), new.name().to_string())));

    registry.get_or_create("svc");
    registry.get_or_create("svc");
    registry.replace("svc", CircuitBreaker::of_defaults("svc-v2"));
    let gone = registry.remove("svc").expect("present");

    assert_eq!(added.items(), vec!["svc".to_string()]);
    assert_eq!(replaced.items(), vec![("svc".to_string(), "svc-v2".to_string())]);
    assert_eq!(removed.items(), vec!["svc-v2".to_string()]);
    assert_eq!(gone.name(), "svc-v2");
    assert!(registry.find("svc").is_none());
    assert!(registry.remove("svc").is_none());
}

#[test]
fn all_is_sorted_by_name() {
    let registry = RetryRegistry::new();
    for name in ["zeta", "alpha", "mid"] {
        registry.get_or_create(name);
    }
    let names: Vec<String> = registry.all().iter().map(|r| r.name().to_string()).collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}

#[test]
fn concurrent_creation_yields_one_instance() {
    let registry = CircuitBreakerRegistry::new();
    let added = Recorded::new();
    let sink = added.clone();
    registry.events().on_entry_added(move |cb| sink.push(cb.name().to_string()));

    let handles: Vec<CircuitBreaker> = std::thread::scope(|scope| {
        let spawned: Vec<_> =
            (0..16).map(|_| scope.spawn(|| registry.get_or_create("shared"))).collect();
        spawned.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(handles.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    assert_eq!(added.len(), 1);
}

#[test]
fn named_configurations_are_resolved() {
    let registry = RetryRegistry::new();
    registry
        .add_configuration("patient", RetryConfig::builder().max_attempts(10).build().unwrap())
        .unwrap();

    let retry = registry.get_or_create_with_config_name("slow-backend", "patient").unwrap();
    assert_eq!(retry.config().max_attempts(), 10);

    let by_default = registry.get_or_create_with_config_name("other", "default").unwrap();
    assert!(Arc::ptr_eq(by_default.config(), &registry.default_config()));
}
