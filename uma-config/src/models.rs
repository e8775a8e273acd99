//! Typed configuration sections with coded defaults.
//!
//! Every section derives `Deserialize` with `#[serde(default)]` so a partial
//! config file (or none at all) always yields a complete, valid `Config`.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub mcp: McpConfig,
    pub cache: CacheSettings,
    pub scheduler: SchedulerConfig,
    pub operations: OperationsConfig,
    pub rate_limit: RateLimitSettings,
    pub probes: ProbesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Loopback only: the daemon assumes a trusted local caller.
            host: "127.0.0.1".to_string(),
            port: 34_600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 34_601,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub janitor_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl_secs: 60,
            janitor_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub high_interval_secs: u64,
    pub medium_interval_secs: u64,
    pub low_interval_secs: u64,
    /// When false, registered intervals are used as-is.
    pub adaptive: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_interval_secs: 1,
            medium_interval_secs: 5,
            low_interval_secs: 30,
            adaptive: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub retention_hours: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            timeout_secs: 30 * 60,
            retention_hours: 24,
        }
    }
}

/// Per-class token-window budgets. Limits are requests per window.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub general_limit: u32,
    pub general_window_secs: u64,
    pub health_limit: u32,
    pub health_window_secs: u64,
    pub bulk_limit: u32,
    pub bulk_window_secs: u64,
    pub expensive_limit: u32,
    pub expensive_window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            general_limit: 120,
            general_window_secs: 60,
            health_limit: 600,
            health_window_secs: 60,
            bulk_limit: 10,
            bulk_window_secs: 60,
            expensive_limit: 6,
            expensive_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbesConfig {
    /// Root of the procfs tree. Overridable so tests can point probes at a
    /// fixture directory.
    pub proc_root: String,
    pub docker_bin: String,
    pub virsh_bin: String,
    pub smartctl_bin: String,
    pub sensors_bin: String,
    pub apcaccess_bin: String,
    pub nvidia_smi_bin: String,
    pub hdparm_bin: String,
    /// Block devices to poll for SMART data, e.g. `/dev/sda`. Empty means
    /// SMART collection is skipped.
    pub smart_devices: Vec<String>,
    /// Directory scanned for user scripts.
    pub scripts_dir: String,
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            proc_root: "/proc".to_string(),
            docker_bin: "docker".to_string(),
            virsh_bin: "virsh".to_string(),
            smartctl_bin: "smartctl".to_string(),
            sensors_bin: "sensors".to_string(),
            apcaccess_bin: "apcaccess".to_string(),
            nvidia_smi_bin: "nvidia-smi".to_string(),
            hdparm_bin: "hdparm".to_string(),
            smart_devices: Vec::new(),
            scripts_dir: "/boot/config/plugins/user.scripts/scripts".to_string(),
        }
    }
}
