//! State-change detection over cached snapshots.
//!
//! Each cycle fetches the latest snapshot per domain from the cache, diffs it
//! against retained state, buffers the resulting events, and flushes them in
//! a fixed order (system → docker → vm → storage, then resource alerts) so
//! downstream consumers can assume an ordering.
//!
//! Thresholded numeric rules (cpu, memory, disk usage) diff against the last
//! *published* baseline rather than the last observed value: a move of
//! 50 → 58 → 62 emits exactly one event with `previous = 50`. State and
//! count rules diff against the last observed snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::MetricsCache;
use crate::types::{
    DockerSnapshot, Namespace, StorageSnapshot, SystemSnapshot, VmSnapshot, keys,
};

use super::bus::EventBus;
use super::{Event, EventSource, topics};

const CPU_DELTA_THRESHOLD: f64 = 10.0;
const MEMORY_DELTA_THRESHOLD: f64 = 15.0;
const DISK_DELTA_THRESHOLD: f64 = 5.0;

const CPU_ALERT_THRESHOLD: f64 = 90.0;
const MEMORY_ALERT_THRESHOLD: f64 = 85.0;
const DISK_ALERT_THRESHOLD: f64 = 90.0;

#[derive(Default)]
struct DetectorState {
    cpu_baseline: Option<f64>,
    memory_baseline: Option<f64>,
    disk_baselines: HashMap<String, f64>,
    last_docker: Option<DockerSnapshot>,
    last_vm: Option<VmSnapshot>,
    last_array_state: Option<String>,
    last_storage_devices: Option<Vec<String>>,
    /// Alert keys currently above their threshold, for edge triggering.
    alerts_active: HashMap<String, bool>,
}

pub struct ChangeDetector {
    cache: Arc<MetricsCache>,
    bus: EventBus,
    interval: Duration,
    state: Mutex<DetectorState>,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("interval", &self.interval)
            .finish()
    }
}

impl ChangeDetector {
    pub fn new(cache: Arc<MetricsCache>, bus: EventBus, interval: Duration) -> Self {
        Self {
            cache,
            bus,
            interval,
            state: Mutex::new(DetectorState::default()),
        }
    }

    /// Run detection loops until cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("change detector stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let published = self.run_cycle();
                        if published > 0 {
                            debug!(published, "change detector published events");
                        }
                    }
                }
            }
        })
    }

    /// One detection cycle. Returns the number of events published.
    pub fn run_cycle(&self) -> usize {
        let mut state = self.state.lock();
        let mut events = Vec::new();

        self.detect_system(&mut state, &mut events);
        self.detect_docker(&mut state, &mut events);
        self.detect_vm(&mut state, &mut events);
        self.detect_storage(&mut state, &mut events);
        self.detect_alerts(&mut state, &mut events);

        let count = events.len();
        for event in events {
            self.bus.publish(event);
        }
        count
    }

    fn snapshot<T: serde::de::DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Option<T> {
        let value = self.cache.get(namespace, key)?;
        match serde_json::from_value(value.as_ref().clone()) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(%namespace, key, %err, "cached snapshot failed to deserialize");
                None
            }
        }
    }

    fn detect_system(&self, state: &mut DetectorState, events: &mut Vec<Event>) {
        let Some(snap) =
            self.snapshot::<SystemSnapshot>(Namespace::System, keys::SYSTEM_METRICS)
        else {
            return;
        };

        if let Some(cpu) = snap.cpu {
            match state.cpu_baseline {
                None => state.cpu_baseline = Some(cpu.usage_percent),
                Some(baseline)
                    if (cpu.usage_percent - baseline).abs() > CPU_DELTA_THRESHOLD =>
                {
                    events.push(Event::new(
                        EventSource::System,
                        topics::CPU_USAGE_CHANGE,
                        json!({
                            "previous": baseline,
                            "current": cpu.usage_percent,
                        }),
                    ));
                    state.cpu_baseline = Some(cpu.usage_percent);
                }
                Some(_) => {}
            }
        }

        if let Some(memory) = snap.memory {
            match state.memory_baseline {
                None => state.memory_baseline = Some(memory.usage_percent),
                Some(baseline)
                    if (memory.usage_percent - baseline).abs()
                        > MEMORY_DELTA_THRESHOLD =>
                {
                    events.push(Event::new(
                        EventSource::System,
                        topics::MEMORY_USAGE_CHANGE,
                        json!({
                            "previous": baseline,
                            "current": memory.usage_percent,
                        }),
                    ));
                    state.memory_baseline = Some(memory.usage_percent);
                }
                Some(_) => {}
            }
        }
    }

    fn detect_docker(&self, state: &mut DetectorState, events: &mut Vec<Event>) {
        let Some(snap) =
            self.snapshot::<DockerSnapshot>(Namespace::Docker, keys::DOCKER_CONTAINERS)
        else {
            return;
        };

        if let Some(last) = &state.last_docker {
            if snap.total != last.total {
                events.push(Event::new(
                    EventSource::Docker,
                    topics::CONTAINER_COUNT_CHANGE,
                    json!({ "previous": last.total, "current": snap.total }),
                ));
            }
            for container in &snap.containers {
                let Some(previous) =
                    last.containers.iter().find(|c| c.name == container.name)
                else {
                    events.push(
                        Event::new(
                            EventSource::Docker,
                            topics::CONTAINER_STATE_CHANGE,
                            json!({
                                "container": container.name,
                                "previous": null,
                                "current": container.state,
                            }),
                        )
                        .with_action("container_created")
                        .with_resource(container.name.clone()),
                    );
                    continue;
                };
                if previous.state != container.state {
                    let action = if container.state == "running" {
                        "container_started"
                    } else {
                        "container_stopped"
                    };
                    events.push(
                        Event::new(
                            EventSource::Docker,
                            topics::CONTAINER_STATE_CHANGE,
                            json!({
                                "container": container.name,
                                "previous": previous.state,
                                "current": container.state,
                            }),
                        )
                        .with_action(action)
                        .with_resource(container.name.clone()),
                    );
                }
            }
            for removed in last
                .containers
                .iter()
                .filter(|c| !snap.containers.iter().any(|n| n.name == c.name))
            {
                events.push(
                    Event::new(
                        EventSource::Docker,
                        topics::CONTAINER_STATE_CHANGE,
                        json!({
                            "container": removed.name,
                            "previous": removed.state,
                            "current": null,
                        }),
                    )
                    .with_action("container_removed")
                    .with_resource(removed.name.clone()),
                );
            }
        }
        state.last_docker = Some(snap);
    }

    fn detect_vm(&self, state: &mut DetectorState, events: &mut Vec<Event>) {
        let Some(snap) = self.snapshot::<VmSnapshot>(Namespace::Vm, keys::VM_MACHINES)
        else {
            return;
        };

        if let Some(last) = &state.last_vm {
            if snap.total != last.total {
                events.push(Event::new(
                    EventSource::Vm,
                    topics::VM_COUNT_CHANGE,
                    json!({ "previous": last.total, "current": snap.total }),
                ));
            }
            for machine in &snap.machines {
                let Some(previous) =
                    last.machines.iter().find(|m| m.name == machine.name)
                else {
                    events.push(
                        Event::new(
                            EventSource::Vm,
                            topics::VM_STATE_CHANGE,
                            json!({
                                "vm": machine.name,
                                "previous": null,
                                "current": machine.state,
                            }),
                        )
                        .with_action("vm_created")
                        .with_resource(machine.name.clone()),
                    );
                    continue;
                };
                if previous.state != machine.state {
                    let action = if machine.state == "running" {
                        "vm_started"
                    } else {
                        "vm_stopped"
                    };
                    events.push(
                        Event::new(
                            EventSource::Vm,
                            topics::VM_STATE_CHANGE,
                            json!({
                                "vm": machine.name,
                                "previous": previous.state,
                                "current": machine.state,
                            }),
                        )
                        .with_action(action)
                        .with_resource(machine.name.clone()),
                    );
                }
            }
            for removed in last
                .machines
                .iter()
                .filter(|m| !snap.machines.iter().any(|n| n.name == m.name))
            {
                events.push(
                    Event::new(
                        EventSource::Vm,
                        topics::VM_STATE_CHANGE,
                        json!({
                            "vm": removed.name,
                            "previous": removed.state,
                            "current": null,
                        }),
                    )
                    .with_action("vm_removed")
                    .with_resource(removed.name.clone()),
                );
            }
        }
        state.last_vm = Some(snap);
    }

    fn detect_storage(&self, state: &mut DetectorState, events: &mut Vec<Event>) {
        let Some(snap) =
            self.snapshot::<StorageSnapshot>(Namespace::Storage, keys::DISK_USAGE)
        else {
            return;
        };

        for fs in &snap.filesystems {
            match state.disk_baselines.get(&fs.mount_point) {
                None => {
                    state
                        .disk_baselines
                        .insert(fs.mount_point.clone(), fs.usage_percent);
                }
                Some(&baseline)
                    if (fs.usage_percent - baseline).abs() > DISK_DELTA_THRESHOLD =>
                {
                    events.push(
                        Event::new(
                            EventSource::Storage,
                            topics::DISK_USAGE_CHANGE,
                            json!({
                                "disk": fs.mount_point,
                                "previous": baseline,
                                "current": fs.usage_percent,
                            }),
                        )
                        .with_resource(fs.mount_point.clone()),
                    );
                    state
                        .disk_baselines
                        .insert(fs.mount_point.clone(), fs.usage_percent);
                }
                Some(_) => {}
            }
        }

        if let Some(array) = &snap.array {
            if let Some(last_state) = &state.last_array_state {
                if *last_state != array.state {
                    let action = if array.state.starts_with("Started") {
                        "array_started"
                    } else if array.state.starts_with("Stopped") {
                        "array_stopped"
                    } else {
                        topics::ARRAY_STATUS_CHANGE
                    };
                    events.push(
                        Event::new(
                            EventSource::Storage,
                            topics::ARRAY_STATUS_CHANGE,
                            json!({
                                "previous": last_state,
                                "current": array.state,
                            }),
                        )
                        .with_action(action),
                    );
                }
            }
            state.last_array_state = Some(array.state.clone());

            // Device membership diffs become disk_added/disk_removed events,
            // which also feed the invalidation router.
            let devices: Vec<String> = array
                .devices
                .iter()
                .flat_map(|d| d.members.iter().cloned())
                .collect();
            if let Some(last_devices) = &state.last_storage_devices {
                for added in devices.iter().filter(|d| !last_devices.contains(d)) {
                    events.push(
                        Event::new(
                            EventSource::Storage,
                            topics::DISK_ADDED,
                            json!({ "disk": added }),
                        )
                        .with_resource(added.clone()),
                    );
                }
                for removed in last_devices.iter().filter(|d| !devices.contains(d)) {
                    events.push(
                        Event::new(
                            EventSource::Storage,
                            topics::DISK_REMOVED,
                            json!({ "disk": removed }),
                        )
                        .with_resource(removed.clone()),
                    );
                }
            }
            state.last_storage_devices = Some(devices);
        }
    }

    /// Edge-triggered resource alerts: one event per threshold crossing.
    fn detect_alerts(&self, state: &mut DetectorState, events: &mut Vec<Event>) {
        let mut checks: Vec<(String, f64, f64)> = Vec::new();

        if let Some(snap) =
            self.snapshot::<SystemSnapshot>(Namespace::System, keys::SYSTEM_METRICS)
        {
            if let Some(cpu) = snap.cpu {
                checks.push(("cpu".to_string(), cpu.usage_percent, CPU_ALERT_THRESHOLD));
            }
            if let Some(memory) = snap.memory {
                checks.push((
                    "memory".to_string(),
                    memory.usage_percent,
                    MEMORY_ALERT_THRESHOLD,
                ));
            }
        }
        if let Some(snap) =
            self.snapshot::<StorageSnapshot>(Namespace::Storage, keys::DISK_USAGE)
        {
            for fs in &snap.filesystems {
                checks.push((
                    format!("disk:{}", fs.mount_point),
                    fs.usage_percent,
                    DISK_ALERT_THRESHOLD,
                ));
            }
        }

        for (key, value, threshold) in checks {
            let above = value > threshold;
            let was_above = state.alerts_active.get(&key).copied().unwrap_or(false);
            if above && !was_above {
                events.push(Event::new(
                    EventSource::System,
                    topics::RESOURCE_ALERT,
                    json!({
                        "resource": key,
                        "value": value,
                        "threshold": threshold,
                    }),
                ));
            }
            state.alerts_active.insert(key, above);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::events::bus::TopicFilter;
    use crate::types::{
        ContainerInfo, CpuMetrics, FilesystemUsage, MemoryMetrics,
    };

    use super::*;

    fn harness() -> (Arc<MetricsCache>, EventBus, ChangeDetector) {
        let cache = Arc::new(MetricsCache::new(64, Duration::from_secs(60)));
        let bus = EventBus::new(64);
        let detector =
            ChangeDetector::new(cache.clone(), bus.clone(), Duration::from_secs(1));
        (cache, bus, detector)
    }

    fn put_cpu(cache: &MetricsCache, usage: f64) {
        let snap = SystemSnapshot {
            cpu: Some(CpuMetrics {
                usage_percent: usage,
                cores: 4,
            }),
            ..Default::default()
        };
        cache.set(
            Namespace::System,
            keys::SYSTEM_METRICS,
            serde_json::to_value(&snap).unwrap(),
        );
    }

    #[tokio::test]
    async fn cpu_change_below_threshold_is_silent() {
        let (cache, bus, detector) = harness();
        let mut stream = bus.subscribe(TopicFilter::All);

        put_cpu(&cache, 50.0);
        detector.run_cycle();
        put_cpu(&cache, 60.0);
        detector.run_cycle();

        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn cpu_change_above_threshold_fires_once_from_baseline() {
        let (cache, bus, detector) = harness();
        let mut stream =
            bus.subscribe(TopicFilter::topics([topics::CPU_USAGE_CHANGE]));

        put_cpu(&cache, 50.0);
        detector.run_cycle();
        put_cpu(&cache, 58.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_none());

        put_cpu(&cache, 62.0);
        detector.run_cycle();

        let event = stream.try_recv().unwrap();
        assert_eq!(event.payload["previous"], json!(50.0));
        assert_eq!(event.payload["current"], json!(62.0));
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn boundary_61_fires_60_does_not() {
        let (cache, bus, detector) = harness();
        let mut stream =
            bus.subscribe(TopicFilter::topics([topics::CPU_USAGE_CHANGE]));

        put_cpu(&cache, 50.0);
        detector.run_cycle();
        put_cpu(&cache, 60.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_none());

        put_cpu(&cache, 61.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_some());
    }

    fn put_containers(cache: &MetricsCache, specs: &[(&str, &str)]) {
        let containers: Vec<ContainerInfo> = specs
            .iter()
            .map(|(name, state)| ContainerInfo {
                id: format!("id-{name}"),
                name: name.to_string(),
                image: "img".to_string(),
                state: state.to_string(),
                status: String::new(),
            })
            .collect();
        let snap = DockerSnapshot {
            running: containers.iter().filter(|c| c.state == "running").count(),
            total: containers.len(),
            containers,
        };
        cache.set(
            Namespace::Docker,
            keys::DOCKER_CONTAINERS,
            serde_json::to_value(&snap).unwrap(),
        );
    }

    #[tokio::test]
    async fn container_state_and_count_changes() {
        let (cache, bus, detector) = harness();
        let mut stream = bus.subscribe(TopicFilter::topics(["docker"]));

        put_containers(&cache, &[("plex", "running"), ("redis", "running")]);
        detector.run_cycle();
        assert!(stream.try_recv().is_none());

        put_containers(&cache, &[("plex", "exited")]);
        detector.run_cycle();

        let count = stream.try_recv().unwrap();
        assert_eq!(count.topic, topics::CONTAINER_COUNT_CHANGE);
        let state_change = stream.try_recv().unwrap();
        assert_eq!(state_change.topic, topics::CONTAINER_STATE_CHANGE);
        assert_eq!(state_change.action, "container_stopped");
        let removed = stream.try_recv().unwrap();
        assert_eq!(removed.action, "container_removed");
        assert_eq!(removed.resource.as_deref(), Some("redis"));
    }

    fn put_disk(cache: &MetricsCache, mount: &str, usage: f64) {
        let snap = StorageSnapshot {
            filesystems: vec![FilesystemUsage {
                filesystem: "/dev/md0".to_string(),
                mount_point: mount.to_string(),
                total_bytes: 1000,
                used_bytes: (usage * 10.0) as u64,
                available_bytes: 0,
                usage_percent: usage,
            }],
            ..Default::default()
        };
        cache.set(
            Namespace::Storage,
            keys::DISK_USAGE,
            serde_json::to_value(&snap).unwrap(),
        );
    }

    #[tokio::test]
    async fn disk_usage_threshold_is_five_percent() {
        let (cache, bus, detector) = harness();
        let mut stream =
            bus.subscribe(TopicFilter::topics([topics::DISK_USAGE_CHANGE]));

        put_disk(&cache, "/mnt/disk1", 70.0);
        detector.run_cycle();
        put_disk(&cache, "/mnt/disk1", 74.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_none());

        put_disk(&cache, "/mnt/disk1", 76.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_some());
    }

    #[tokio::test]
    async fn resource_alert_fires_once_per_crossing() {
        let (cache, bus, detector) = harness();
        let mut stream =
            bus.subscribe(TopicFilter::topics([topics::RESOURCE_ALERT]));

        let put = |usage: f64| {
            let snap = SystemSnapshot {
                memory: Some(MemoryMetrics {
                    total_kb: 1000,
                    available_kb: 0,
                    used_kb: 0,
                    usage_percent: usage,
                }),
                ..Default::default()
            };
            cache.set(
                Namespace::System,
                keys::SYSTEM_METRICS,
                serde_json::to_value(&snap).unwrap(),
            );
        };

        put(90.0);
        detector.run_cycle();
        let alert = stream.try_recv().unwrap();
        assert_eq!(alert.payload["resource"], "memory");

        // Still above: no repeat.
        put(92.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_none());

        // Dip below and cross again: a fresh alert.
        put(50.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_none());
        put(95.0);
        detector.run_cycle();
        assert!(stream.try_recv().is_some());
    }

    #[tokio::test]
    async fn absent_snapshot_skips_domain() {
        let (_cache, bus, detector) = harness();
        let mut stream = bus.subscribe(TopicFilter::All);
        assert_eq!(detector.run_cycle(), 0);
        assert!(stream.try_recv().is_none());
    }
}
