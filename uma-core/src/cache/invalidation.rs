//! Strategy-driven cache invalidation.
//!
//! Strategies are registered per cache namespace. On a domain event the
//! router evaluates every registered strategy against every live entry of
//! that namespace, collects the keys hit by any strategy, and deletes them in
//! one pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::bus::TopicFilter;
use crate::events::{Event, EventBus, EventSource};
use crate::types::Namespace;

use super::{EntryMeta, MetricsCache};

/// Decides whether a cache entry should be evicted in response to an event.
pub trait InvalidationStrategy: Send + Sync {
    fn matches(&self, key: &str, entry: &EntryMeta, event: &Event) -> bool;
    fn description(&self) -> String;
}

/// Invalidate keys beginning with any of a set of prefixes, when the event
/// source (and, if registered, its action) matches.
pub struct PrefixStrategy {
    source: EventSource,
    actions: Option<HashSet<String>>,
    prefixes: Vec<String>,
}

impl PrefixStrategy {
    pub fn new<I, S>(source: EventSource, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source,
            actions: None,
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Restrict the strategy to a set of trigger actions.
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = Some(actions.into_iter().map(Into::into).collect());
        self
    }
}

impl InvalidationStrategy for PrefixStrategy {
    fn matches(&self, key: &str, _entry: &EntryMeta, event: &Event) -> bool {
        if event.source != self.source {
            return false;
        }
        if let Some(actions) = &self.actions
            && !actions.contains(&event.action)
        {
            return false;
        }
        self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    fn description(&self) -> String {
        format!(
            "prefix [{}] on {} events",
            self.prefixes.join(", "),
            self.source.as_str()
        )
    }
}

/// Invalidate keys containing the event's resource name, for a registered
/// (source, actions) tuple.
pub struct ResourceStrategy {
    source: EventSource,
    actions: HashSet<String>,
}

impl ResourceStrategy {
    pub fn new<I, S>(source: EventSource, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source,
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }
}

impl InvalidationStrategy for ResourceStrategy {
    fn matches(&self, key: &str, _entry: &EntryMeta, event: &Event) -> bool {
        if event.source != self.source || !self.actions.contains(&event.action) {
            return false;
        }
        match &event.resource {
            Some(resource) => key.contains(resource.as_str()),
            // Resource-less events of a matching action clear the namespace.
            None => true,
        }
    }

    fn description(&self) -> String {
        let mut actions: Vec<_> = self.actions.iter().cloned().collect();
        actions.sort();
        format!("{} ∈ [{}]", self.source.as_str(), actions.join(", "))
    }
}

/// Invalidate entries older than `max_age`, regardless of the event.
pub struct TimeBasedStrategy {
    max_age: Duration,
}

impl TimeBasedStrategy {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

impl InvalidationStrategy for TimeBasedStrategy {
    fn matches(&self, _key: &str, entry: &EntryMeta, _event: &Event) -> bool {
        entry.age > self.max_age
    }

    fn description(&self) -> String {
        format!("older than {:?}", self.max_age)
    }
}

type Registration = (Namespace, Box<dyn InvalidationStrategy>);

/// Routes domain events to strategy-matched cache evictions.
pub struct InvalidationRouter {
    cache: Arc<MetricsCache>,
    strategies: RwLock<Vec<Registration>>,
}

impl std::fmt::Debug for InvalidationRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRouter")
            .field("strategies", &self.strategies.read().len())
            .finish()
    }
}

impl InvalidationRouter {
    pub fn new(cache: Arc<MetricsCache>) -> Self {
        Self {
            cache,
            strategies: RwLock::new(Vec::new()),
        }
    }

    /// The default wiring: SMART and disk info react to storage topology
    /// events, sensor readings age out, system info reacts to lifecycle
    /// events, container/vm info react to their domain events.
    pub fn with_default_wiring(cache: Arc<MetricsCache>) -> Self {
        let router = Self::new(cache);

        const STORAGE_TOPOLOGY: [&str; 4] =
            ["disk_added", "disk_removed", "array_started", "array_stopped"];

        router.register(
            Namespace::Smart,
            ResourceStrategy::new(EventSource::Storage, STORAGE_TOPOLOGY),
        );
        router.register(
            Namespace::Smart,
            PrefixStrategy::new(EventSource::Storage, ["smart_", "disk_"])
                .with_actions(STORAGE_TOPOLOGY),
        );

        router.register(
            Namespace::Sensor,
            TimeBasedStrategy::new(Duration::from_secs(120)),
        );

        router.register(
            Namespace::System,
            ResourceStrategy::new(
                EventSource::System,
                ["reboot", "shutdown", "config_changed"],
            ),
        );

        const STORAGE_REFRESH: [&str; 5] = [
            "disk_added",
            "disk_removed",
            "array_started",
            "array_stopped",
            "parity_check_completed",
        ];
        router.register(
            Namespace::Storage,
            ResourceStrategy::new(EventSource::Storage, STORAGE_REFRESH),
        );
        router.register(
            Namespace::Storage,
            PrefixStrategy::new(EventSource::Storage, ["disk_", "array_"])
                .with_actions(STORAGE_REFRESH),
        );

        const DOCKER_LIFECYCLE: [&str; 4] = [
            "container_started",
            "container_stopped",
            "container_created",
            "container_removed",
        ];
        router.register(
            Namespace::Docker,
            ResourceStrategy::new(EventSource::Docker, DOCKER_LIFECYCLE),
        );
        router.register(
            Namespace::Docker,
            PrefixStrategy::new(EventSource::Docker, ["container_", "docker_"])
                .with_actions(DOCKER_LIFECYCLE),
        );

        const VM_LIFECYCLE: [&str; 4] =
            ["vm_started", "vm_stopped", "vm_created", "vm_removed"];
        router.register(
            Namespace::Vm,
            ResourceStrategy::new(EventSource::Vm, VM_LIFECYCLE),
        );
        router.register(
            Namespace::Vm,
            PrefixStrategy::new(EventSource::Vm, ["vm_", "libvirt_"])
                .with_actions(VM_LIFECYCLE),
        );

        router
    }

    pub fn register<S>(&self, namespace: Namespace, strategy: S)
    where
        S: InvalidationStrategy + 'static,
    {
        debug!(
            %namespace,
            strategy = %strategy.description(),
            "registered invalidation strategy"
        );
        self.strategies.write().push((namespace, Box::new(strategy)));
    }

    /// Evaluate strategies for one event and delete every matched key.
    /// Returns the number of evicted entries.
    pub fn handle_event(&self, event: &Event) -> usize {
        let strategies = self.strategies.read();
        let mut evicted = 0;

        let namespaces: HashSet<Namespace> =
            strategies.iter().map(|(ns, _)| *ns).collect();
        for namespace in namespaces {
            let entries = self.cache.live_entries(namespace);
            let matched: Vec<String> = entries
                .iter()
                .filter(|entry| {
                    strategies
                        .iter()
                        .filter(|(ns, _)| *ns == namespace)
                        .any(|(_, s)| s.matches(&entry.key, entry, event))
                })
                .map(|entry| entry.key.clone())
                .collect();

            if !matched.is_empty() {
                let removed = self.cache.delete_many(namespace, &matched);
                debug!(
                    %namespace,
                    removed,
                    topic = %event.topic,
                    "invalidation evicted cache entries"
                );
                evicted += removed;
            }
        }
        evicted
    }

    /// Drain domain events from the bus until cancelled.
    pub fn spawn(
        self: Arc<Self>,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut stream = bus.subscribe(TopicFilter::topics([
            EventSource::Storage.as_str(),
            EventSource::System.as_str(),
            EventSource::Docker.as_str(),
            EventSource::Vm.as_str(),
        ]));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("invalidation router stopping");
                        break;
                    }
                    event = stream.recv() => {
                        match event {
                            Some(event) => {
                                self.handle_event(&event);
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::events::topics;

    use super::*;

    fn cache() -> Arc<MetricsCache> {
        Arc::new(MetricsCache::new(64, Duration::from_secs(300)))
    }

    #[test]
    fn disk_removed_evicts_matching_smart_key_only() {
        let c = cache();
        let router = InvalidationRouter::with_default_wiring(c.clone());

        c.set(Namespace::Smart, "sda", json!({"device": "sda"}));
        c.set(Namespace::Smart, "sdb", json!({"device": "sdb"}));

        let event = Event::new(
            EventSource::Storage,
            topics::DISK_REMOVED,
            json!({"disk": "sda"}),
        )
        .with_resource("sda");
        let evicted = router.handle_event(&event);

        assert_eq!(evicted, 1);
        assert!(c.get(Namespace::Smart, "sda").is_none());
        assert!(c.get(Namespace::Smart, "sdb").is_some());
    }

    #[test]
    fn array_started_clears_storage_prefixes() {
        let c = cache();
        let router = InvalidationRouter::with_default_wiring(c.clone());

        c.set(Namespace::Storage, "disk_usage", json!({}));
        c.set(Namespace::Storage, "array_status", json!({}));
        c.set(Namespace::Sensor, "sensors", json!({}));

        let event = Event::new(EventSource::Storage, "array_status_change", json!({}))
            .with_action("array_started");
        router.handle_event(&event);

        assert!(c.get(Namespace::Storage, "disk_usage").is_none());
        assert!(c.get(Namespace::Storage, "array_status").is_none());
        assert!(c.get(Namespace::Sensor, "sensors").is_some());
    }

    #[test]
    fn docker_event_does_not_touch_vm_namespace() {
        let c = cache();
        let router = InvalidationRouter::with_default_wiring(c.clone());

        c.set(Namespace::Docker, "container_list", json!({}));
        c.set(Namespace::Vm, "vm_list", json!({}));

        let event = Event::new(
            EventSource::Docker,
            topics::CONTAINER_STATE_CHANGE,
            json!({}),
        )
        .with_action("container_stopped")
        .with_resource("plex");
        router.handle_event(&event);

        // Prefix strategy hits container_list; vm namespace is untouched.
        assert!(c.get(Namespace::Docker, "container_list").is_none());
        assert!(c.get(Namespace::Vm, "vm_list").is_some());
    }

    #[test]
    fn time_based_strategy_ages_out_sensor_entries() {
        let c = cache();
        let router = InvalidationRouter::new(c.clone());
        router.register(
            Namespace::Sensor,
            TimeBasedStrategy::new(Duration::from_millis(10)),
        );

        c.set(Namespace::Sensor, "sensors", json!({}));
        std::thread::sleep(Duration::from_millis(30));

        // Any routed event triggers the age check.
        let event = Event::new(EventSource::System, "tick", json!({}));
        let evicted = router.handle_event(&event);
        assert_eq!(evicted, 1);
        assert!(c.get(Namespace::Sensor, "sensors").is_none());
    }

    #[tokio::test]
    async fn router_worker_drains_bus_events() {
        let c = cache();
        let bus = EventBus::new(16);
        let router = Arc::new(InvalidationRouter::with_default_wiring(c.clone()));

        let shutdown = CancellationToken::new();
        let handle = router.clone().spawn(bus.clone(), shutdown.clone());

        c.set(Namespace::Smart, "sda", json!({}));
        bus.publish(
            Event::new(
                EventSource::Storage,
                topics::DISK_REMOVED,
                json!({"disk": "sda"}),
            )
            .with_resource("sda"),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(c.get(Namespace::Smart, "sda").is_none());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
