//! The default collector set: thin adapters binding each probe to a cache
//! key, plus the registration table the supervisor installs at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ProbeError;
use crate::probes::command::CommandRunner;
use crate::probes::docker::DockerProbe;
use crate::probes::gpu::GpuProbe;
use crate::probes::network::NetworkProbe;
use crate::probes::scripts::ScriptsProbe;
use crate::probes::sensors::SensorsProbe;
use crate::probes::smart::SmartProbe;
use crate::probes::spindown::SpindownProbe;
use crate::probes::storage::StorageProbe;
use crate::probes::system::SystemProbe;
use crate::probes::ups::UpsProbe;
use crate::probes::vm::VirshProbe;
use crate::types::{Namespace, keys};

use super::{Collector, CollectorScheduler, Priority, Registration};

fn to_value<T: serde::Serialize>(record: &T) -> Result<Value, ProbeError> {
    serde_json::to_value(record)
        .map_err(|err| ProbeError::Parse(format!("serializing record: {err}")))
}

/// All probe instances, shared between collectors and the supervisor.
pub struct ProbeSet {
    pub system: Arc<SystemProbe>,
    pub network: Arc<NetworkProbe>,
    pub storage: Arc<StorageProbe>,
    pub docker: Arc<DockerProbe>,
    pub vm: Arc<VirshProbe>,
    pub smart: Arc<SmartProbe>,
    pub sensors: Arc<SensorsProbe>,
    pub ups: Arc<UpsProbe>,
    pub gpu: Arc<GpuProbe>,
    pub spindown: Arc<SpindownProbe>,
    pub scripts: Arc<ScriptsProbe>,
    pub smart_devices: Vec<String>,
}

impl std::fmt::Debug for ProbeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeSet")
            .field("smart_devices", &self.smart_devices)
            .finish()
    }
}

impl ProbeSet {
    pub fn from_config(
        cfg: &uma_config::ProbesConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            system: Arc::new(SystemProbe::new(&cfg.proc_root)),
            network: Arc::new(NetworkProbe::new(&cfg.proc_root)),
            storage: Arc::new(StorageProbe::new(&cfg.proc_root, runner.clone())),
            docker: Arc::new(DockerProbe::new(runner.clone(), &cfg.docker_bin)),
            vm: Arc::new(VirshProbe::new(runner.clone(), &cfg.virsh_bin)),
            smart: Arc::new(SmartProbe::new(runner.clone(), &cfg.smartctl_bin)),
            sensors: Arc::new(SensorsProbe::new(runner.clone(), &cfg.sensors_bin)),
            ups: Arc::new(UpsProbe::new(runner.clone(), &cfg.apcaccess_bin)),
            gpu: Arc::new(GpuProbe::new(runner.clone(), &cfg.nvidia_smi_bin)),
            spindown: Arc::new(SpindownProbe::new(runner, &cfg.hdparm_bin)),
            scripts: Arc::new(ScriptsProbe::new(&cfg.scripts_dir)),
            smart_devices: cfg.smart_devices.clone(),
        }
    }
}

struct SystemInfoCollector(Arc<SystemProbe>);

#[async_trait]
impl Collector for SystemInfoCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.read_info().await?)
    }
}

struct SystemMetricsCollector(Arc<SystemProbe>);

#[async_trait]
impl Collector for SystemMetricsCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        // Composite: sub-probe failures are already absorbed into the record.
        to_value(&self.0.collect().await)
    }
}

struct NetworkCollector(Arc<NetworkProbe>);

#[async_trait]
impl Collector for NetworkCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct StorageCollector(Arc<StorageProbe>);

#[async_trait]
impl Collector for StorageCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await)
    }
}

struct ArrayCollector(Arc<StorageProbe>);

#[async_trait]
impl Collector for ArrayCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.read_array().await?)
    }
}

struct DockerCollector(Arc<DockerProbe>);

#[async_trait]
impl Collector for DockerCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct VmCollector(Arc<VirshProbe>);

#[async_trait]
impl Collector for VmCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct SensorsCollector(Arc<SensorsProbe>);

#[async_trait]
impl Collector for SensorsCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct UpsCollector(Arc<UpsProbe>);

#[async_trait]
impl Collector for UpsCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct GpuCollector(Arc<GpuProbe>);

#[async_trait]
impl Collector for GpuCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct ScriptsCollector(Arc<ScriptsProbe>);

#[async_trait]
impl Collector for ScriptsCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.0.collect().await?)
    }
}

struct SmartCollector {
    probe: Arc<SmartProbe>,
    device: String,
}

#[async_trait]
impl Collector for SmartCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.probe.collect(&self.device).await?)
    }
}

struct SpindownCollector {
    probe: Arc<SpindownProbe>,
    devices: Vec<String>,
}

#[async_trait]
impl Collector for SpindownCollector {
    async fn collect(&self) -> Result<Value, ProbeError> {
        to_value(&self.probe.collect(&self.devices).await)
    }
}

/// Install the default registration table.
pub fn register_defaults(
    scheduler: &Arc<CollectorScheduler>,
    probes: &ProbeSet,
    cfg: &uma_config::SchedulerConfig,
) -> crate::Result<()> {
    let high = Duration::from_secs(cfg.high_interval_secs);
    let medium = Duration::from_secs(cfg.medium_interval_secs);
    let low = Duration::from_secs(cfg.low_interval_secs);

    let reg = |name: &str, namespace, key: &str, interval, priority| Registration {
        name: name.to_string(),
        namespace,
        key: key.to_string(),
        interval,
        priority,
    };

    scheduler.register(
        reg(
            "system_metrics",
            Namespace::System,
            keys::SYSTEM_METRICS,
            high,
            Priority::High,
        ),
        Arc::new(SystemMetricsCollector(probes.system.clone())),
    )?;
    scheduler.register(
        reg(
            "network_rates",
            Namespace::Network,
            keys::NETWORK_INTERFACES,
            high,
            Priority::High,
        ),
        Arc::new(NetworkCollector(probes.network.clone())),
    )?;
    scheduler.register(
        reg(
            "system_info",
            Namespace::System,
            keys::SYSTEM_INFO,
            low,
            Priority::Low,
        ),
        Arc::new(SystemInfoCollector(probes.system.clone())),
    )?;
    scheduler.register(
        reg(
            "docker_containers",
            Namespace::Docker,
            keys::DOCKER_CONTAINERS,
            medium,
            Priority::Medium,
        ),
        Arc::new(DockerCollector(probes.docker.clone())),
    )?;
    scheduler.register(
        reg(
            "vm_machines",
            Namespace::Vm,
            keys::VM_MACHINES,
            medium,
            Priority::Medium,
        ),
        Arc::new(VmCollector(probes.vm.clone())),
    )?;
    scheduler.register(
        reg(
            "storage_usage",
            Namespace::Storage,
            keys::DISK_USAGE,
            medium,
            Priority::Medium,
        ),
        Arc::new(StorageCollector(probes.storage.clone())),
    )?;
    scheduler.register(
        reg(
            "array_status",
            Namespace::Storage,
            keys::ARRAY_STATUS,
            medium,
            Priority::Medium,
        ),
        Arc::new(ArrayCollector(probes.storage.clone())),
    )?;
    scheduler.register(
        reg(
            "sensors",
            Namespace::Sensor,
            keys::SENSORS,
            low,
            Priority::Low,
        ),
        Arc::new(SensorsCollector(probes.sensors.clone())),
    )?;
    scheduler.register(
        reg("ups", Namespace::Sensor, keys::UPS, low, Priority::Low),
        Arc::new(UpsCollector(probes.ups.clone())),
    )?;
    scheduler.register(
        reg("gpu", Namespace::Sensor, keys::GPU, low, Priority::Low),
        Arc::new(GpuCollector(probes.gpu.clone())),
    )?;
    scheduler.register(
        reg(
            "user_scripts",
            Namespace::General,
            keys::SCRIPTS,
            low,
            Priority::Low,
        ),
        Arc::new(ScriptsCollector(probes.scripts.clone())),
    )?;
    scheduler.register(
        reg(
            "disk_spindown",
            Namespace::Storage,
            keys::SPINDOWN,
            low,
            Priority::Low,
        ),
        Arc::new(SpindownCollector {
            probe: probes.spindown.clone(),
            devices: probes.smart_devices.clone(),
        }),
    )?;

    for device in &probes.smart_devices {
        scheduler.register(
            reg(
                &format!("smart_{}", keys::smart_device(device)),
                Namespace::Smart,
                &keys::smart_device(device),
                low,
                Priority::Low,
            ),
            Arc::new(SmartCollector {
                probe: probes.smart.clone(),
                device: device.clone(),
            }),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use crate::cache::MetricsCache;
    use crate::probes::command::ShellCommandRunner;

    use super::*;

    #[tokio::test]
    async fn default_set_registers_one_worker_per_metric() {
        let cache = Arc::new(MetricsCache::new(256, Duration::from_secs(60)));
        let scheduler = Arc::new(CollectorScheduler::new(
            cache,
            None,
            false,
            CancellationToken::new(),
        ));

        let mut cfg = uma_config::ProbesConfig::default();
        cfg.smart_devices = vec!["/dev/sda".to_string(), "/dev/sdb".to_string()];
        let probes =
            ProbeSet::from_config(&cfg, Arc::new(ShellCommandRunner::default()));

        register_defaults(
            &scheduler,
            &probes,
            &uma_config::SchedulerConfig::default(),
        )
        .unwrap();

        // 12 fixed registrations plus one per SMART device.
        assert_eq!(scheduler.worker_count(), 14);
        scheduler.stop().await;
    }
}
