//! Typed records for each monitored domain.
//!
//! Probes return these records; the scheduler serializes them to JSON for the
//! cache; the change detector deserializes the ones it diffs. Composite
//! records carry optional fields for probe-failed sub-parts plus an `errors`
//! map so partial success stays observable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cache namespaces. Every cached key is addressed as `(namespace, key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    System,
    Docker,
    Vm,
    Storage,
    Sensor,
    Network,
    ArrayInfo,
    Smart,
    General,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Docker => "docker",
            Self::Vm => "vm",
            Self::Storage => "storage",
            Self::Sensor => "sensor",
            Self::Network => "network",
            Self::ArrayInfo => "array_info",
            Self::Smart => "smart",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// System domain
// ---------------------------------------------------------------------------

/// Composite snapshot produced by the system metrics collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadAverages>,
    pub uptime_secs: Option<u64>,
    /// Sub-probe failures keyed by sub-probe name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

/// Host identity; changes only on reboot or reconfiguration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub kernel: String,
    pub cpu_count: usize,
    pub total_memory_kb: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_kb: u64,
    pub available_kb: u64,
    pub used_kb: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadAverages {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

// ---------------------------------------------------------------------------
// Network domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub interfaces: Vec<InterfaceRates>,
}

/// Per-interface throughput derived from successive `/proc/net/dev` counter
/// snapshots. Totals are the raw counters; rates are per-second deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceRates {
    pub name: String,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub rx_packets_per_sec: f64,
    pub tx_packets_per_sec: f64,
}

// ---------------------------------------------------------------------------
// Docker domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerSnapshot {
    pub containers: Vec<ContainerInfo>,
    pub running: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Lifecycle state, e.g. `running`, `exited`.
    pub state: String,
    /// Human status line, e.g. `Up 3 hours`.
    pub status: String,
}

// ---------------------------------------------------------------------------
// VM domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub machines: Vec<VmInfo>,
    pub running: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmInfo {
    /// Libvirt domain id; absent for shut-off machines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub state: String,
}

// ---------------------------------------------------------------------------
// Storage domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array: Option<ArrayStatus>,
    pub filesystems: Vec<FilesystemUsage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

/// md array state parsed from `/proc/mdstat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArrayStatus {
    /// `Started`, `Stopped`, or a resync-related string such as
    /// `Started (check 42.1%)`.
    pub state: String,
    pub devices: Vec<MdDevice>,
    /// In-flight sync action (`check`, `resync`, `recover`), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_action: Option<String>,
    /// Completion percentage of the sync action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_progress: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MdDevice {
    pub name: String,
    pub raid_level: String,
    pub active: bool,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemUsage {
    pub filesystem: String,
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

// ---------------------------------------------------------------------------
// SMART
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmartReport {
    pub device: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_on_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reallocated_sectors: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ---------------------------------------------------------------------------
// Sensors / UPS / GPU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorReading {
    pub chip: String,
    pub label: String,
    pub temperature_c: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_left_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub gpus: Vec<GpuInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub utilization_percent: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub temperature_c: f64,
}

/// Per-disk power state from `hdparm -C`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpindownSnapshot {
    pub disks: Vec<DiskPowerState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskPowerState {
    pub device: String,
    /// `active/idle`, `standby`, or `unknown`.
    pub state: String,
}

// ---------------------------------------------------------------------------
// User scripts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptInventory {
    pub scripts: Vec<ScriptInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub name: String,
    pub path: String,
}

/// Well-known cache keys written by the default collector set.
pub mod keys {
    pub const SYSTEM_INFO: &str = "info";
    pub const SYSTEM_METRICS: &str = "metrics";
    pub const NETWORK_INTERFACES: &str = "interfaces";
    pub const DOCKER_CONTAINERS: &str = "container_list";
    pub const VM_MACHINES: &str = "vm_list";
    pub const ARRAY_STATUS: &str = "array_status";
    pub const DISK_USAGE: &str = "disk_usage";
    pub const SENSORS: &str = "sensors";
    pub const UPS: &str = "ups_status";
    pub const GPU: &str = "gpu_status";
    pub const SCRIPTS: &str = "scripts";
    pub const SPINDOWN: &str = "disk_spindown";

    /// Per-device SMART key: the bare device name, e.g. `sda` for
    /// `/dev/sda`, so resource-scoped invalidation can match it.
    pub fn smart_device(device: &str) -> String {
        device.rsplit('/').next().unwrap_or(device).to_string()
    }
}
