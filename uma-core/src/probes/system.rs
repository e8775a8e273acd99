//! System metrics: CPU, memory, load, uptime, host identity.
//!
//! CPU usage is derived from successive `/proc/stat` counter snapshots; the
//! first cycle reports the since-boot average. Sub-probes are issued
//! concurrently and joined before the composite record is assembled, so one
//! failed source degrades a field instead of the whole snapshot.

use std::path::PathBuf;

use parking_lot::Mutex;

use crate::error::ProbeError;
use crate::types::{
    CpuMetrics, LoadAverages, MemoryMetrics, SystemInfo, SystemSnapshot,
};

use super::read_proc_file;

/// Aggregate jiffies from the `cpu` summary line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn idle_all(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Usage percentage across the interval from `previous` to `self`.
    pub fn usage_since(&self, previous: &CpuTimes) -> f64 {
        let total_delta = self.total().saturating_sub(previous.total());
        if total_delta == 0 {
            return 0.0;
        }
        let idle_delta = self.idle_all().saturating_sub(previous.idle_all());
        100.0 * (1.0 - idle_delta as f64 / total_delta as f64)
    }
}

pub struct SystemProbe {
    proc_root: PathBuf,
    previous_cpu: Mutex<Option<CpuTimes>>,
}

impl std::fmt::Debug for SystemProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemProbe")
            .field("proc_root", &self.proc_root)
            .finish()
    }
}

impl SystemProbe {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous_cpu: Mutex::new(None),
        }
    }

    /// Host identity; cached under `system:info` on a slow cadence.
    pub async fn read_info(&self) -> Result<SystemInfo, ProbeError> {
        let (hostname, kernel, stat, meminfo) = tokio::join!(
            read_proc_file(&self.proc_root, "sys/kernel/hostname"),
            read_proc_file(&self.proc_root, "sys/kernel/osrelease"),
            read_proc_file(&self.proc_root, "stat"),
            read_proc_file(&self.proc_root, "meminfo"),
        );

        let (_, cores) = parse_proc_stat(&stat?)?;
        let memory = parse_meminfo(&meminfo?)?;
        Ok(SystemInfo {
            hostname: hostname?.trim().to_string(),
            kernel: kernel?.trim().to_string(),
            cpu_count: cores,
            total_memory_kb: memory.total_kb,
        })
    }

    /// Composite metrics snapshot. Sub-probe failures land in `errors`.
    pub async fn collect(&self) -> SystemSnapshot {
        let (stat, meminfo, loadavg, uptime) = tokio::join!(
            read_proc_file(&self.proc_root, "stat"),
            read_proc_file(&self.proc_root, "meminfo"),
            read_proc_file(&self.proc_root, "loadavg"),
            read_proc_file(&self.proc_root, "uptime"),
        );

        let mut snapshot = SystemSnapshot::default();

        match stat.and_then(|raw| parse_proc_stat(&raw)) {
            Ok((times, cores)) => {
                let mut previous = self.previous_cpu.lock();
                let baseline = previous.unwrap_or_default();
                snapshot.cpu = Some(CpuMetrics {
                    usage_percent: times.usage_since(&baseline),
                    cores,
                });
                *previous = Some(times);
            }
            Err(err) => {
                snapshot.errors.insert("cpu".to_string(), err.to_string());
            }
        }

        match meminfo.and_then(|raw| parse_meminfo(&raw)) {
            Ok(memory) => snapshot.memory = Some(memory),
            Err(err) => {
                snapshot
                    .errors
                    .insert("memory".to_string(), err.to_string());
            }
        }

        match loadavg.and_then(|raw| parse_loadavg(&raw)) {
            Ok(load) => snapshot.load = Some(load),
            Err(err) => {
                snapshot.errors.insert("load".to_string(), err.to_string());
            }
        }

        match uptime.and_then(|raw| parse_uptime(&raw)) {
            Ok(secs) => snapshot.uptime_secs = Some(secs),
            Err(err) => {
                snapshot
                    .errors
                    .insert("uptime".to_string(), err.to_string());
            }
        }

        snapshot
    }

    /// Load and memory pressure inputs for the adaptive scheduler:
    /// `(load_per_cpu, memory_used_fraction)`.
    pub async fn pressure(&self) -> Result<(f64, f64), ProbeError> {
        let (loadavg, meminfo, stat) = tokio::join!(
            read_proc_file(&self.proc_root, "loadavg"),
            read_proc_file(&self.proc_root, "meminfo"),
            read_proc_file(&self.proc_root, "stat"),
        );

        let load = parse_loadavg(&loadavg?)?;
        let memory = parse_meminfo(&meminfo?)?;
        let (_, cores) = parse_proc_stat(&stat?)?;

        let load_per_cpu = load.one / cores.max(1) as f64;
        let memory_used = memory.usage_percent / 100.0;
        Ok((load_per_cpu, memory_used))
    }
}

/// Parse `/proc/stat`: the aggregate cpu line plus the per-core line count.
pub fn parse_proc_stat(raw: &str) -> Result<(CpuTimes, usize), ProbeError> {
    let mut times = None;
    let mut cores = 0usize;

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("cpu ") {
            let fields: Vec<u64> = rest
                .split_whitespace()
                .map(|f| f.parse::<u64>())
                .collect::<Result<_, _>>()
                .map_err(|err| {
                    ProbeError::Parse(format!("/proc/stat cpu line: {err}"))
                })?;
            if fields.len() < 8 {
                return Err(ProbeError::Parse(format!(
                    "/proc/stat cpu line has {} fields, expected at least 8",
                    fields.len()
                )));
            }
            times = Some(CpuTimes {
                user: fields[0],
                nice: fields[1],
                system: fields[2],
                idle: fields[3],
                iowait: fields[4],
                irq: fields[5],
                softirq: fields[6],
                steal: fields[7],
            });
        } else if line.starts_with("cpu") {
            cores += 1;
        }
    }

    let times = times
        .ok_or_else(|| ProbeError::Parse("/proc/stat missing cpu line".into()))?;
    Ok((times, cores.max(1)))
}

/// Parse `/proc/meminfo` totals into usage metrics.
pub fn parse_meminfo(raw: &str) -> Result<MemoryMetrics, ProbeError> {
    fn field(raw: &str, name: &str) -> Option<u64> {
        raw.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    let total_kb = field(raw, "MemTotal:")
        .ok_or_else(|| ProbeError::Parse("/proc/meminfo missing MemTotal".into()))?;
    let available_kb = field(raw, "MemAvailable:").ok_or_else(|| {
        ProbeError::Parse("/proc/meminfo missing MemAvailable".into())
    })?;

    let used_kb = total_kb.saturating_sub(available_kb);
    Ok(MemoryMetrics {
        total_kb,
        available_kb,
        used_kb,
        usage_percent: if total_kb == 0 {
            0.0
        } else {
            100.0 * used_kb as f64 / total_kb as f64
        },
    })
}

pub fn parse_loadavg(raw: &str) -> Result<LoadAverages, ProbeError> {
    let mut fields = raw.split_whitespace();
    let mut next = || -> Result<f64, ProbeError> {
        fields
            .next()
            .ok_or_else(|| ProbeError::Parse("/proc/loadavg truncated".into()))?
            .parse()
            .map_err(|err| ProbeError::Parse(format!("/proc/loadavg: {err}")))
    };
    Ok(LoadAverages {
        one: next()?,
        five: next()?,
        fifteen: next()?,
    })
}

pub fn parse_uptime(raw: &str) -> Result<u64, ProbeError> {
    raw.split_whitespace()
        .next()
        .ok_or_else(|| ProbeError::Parse("/proc/uptime empty".into()))?
        .parse::<f64>()
        .map(|secs| secs as u64)
        .map_err(|err| ProbeError::Parse(format!("/proc/uptime: {err}")))
}
