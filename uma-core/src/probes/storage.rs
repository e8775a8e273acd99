//! Storage state: md array status from `/proc/mdstat` plus per-filesystem
//! usage from `df`.
//!
//! Member names are normalized to base device names (`sda1` → `sda`) so
//! topology events line up with SMART cache keys.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ProbeError;
use crate::types::{ArrayStatus, FilesystemUsage, MdDevice, StorageSnapshot};

use super::command::CommandRunner;
use super::read_proc_file;

pub struct StorageProbe {
    proc_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    df_bin: String,
}

impl std::fmt::Debug for StorageProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProbe")
            .field("proc_root", &self.proc_root)
            .field("df_bin", &self.df_bin)
            .finish()
    }
}

impl StorageProbe {
    pub fn new(proc_root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            proc_root: proc_root.into(),
            runner,
            df_bin: "df".to_string(),
        }
    }

    /// Composite snapshot; each source's failure degrades its field.
    pub async fn collect(&self) -> StorageSnapshot {
        let (mdstat, df) = tokio::join!(self.read_array(), self.read_usage());

        let mut snapshot = StorageSnapshot::default();
        match mdstat {
            Ok(array) => snapshot.array = Some(array),
            Err(err) => {
                snapshot.errors.insert("array".to_string(), err.to_string());
            }
        }
        match df {
            Ok(filesystems) => snapshot.filesystems = filesystems,
            Err(err) => {
                snapshot.errors.insert("usage".to_string(), err.to_string());
            }
        }
        snapshot
    }

    pub async fn read_array(&self) -> Result<ArrayStatus, ProbeError> {
        let raw = read_proc_file(&self.proc_root, "mdstat").await?;
        parse_mdstat(&raw)
    }

    pub async fn read_usage(&self) -> Result<Vec<FilesystemUsage>, ProbeError> {
        let args = ["-P".to_string(), "-B1".to_string(), "-l".to_string()];
        let output = self
            .runner
            .run(&self.df_bin, &args)
            .await?
            .require_success(&self.df_bin)?;
        parse_df(&output.stdout)
    }
}

/// Strip the position index and partition suffix from an mdstat member,
/// e.g. `sdb1[2]` → `sdb`, `nvme0n1p2[0]` → `nvme0n1`.
fn member_base_device(member: &str) -> String {
    let name = member.split('[').next().unwrap_or(member);
    if let Some(idx) = name.rfind('p')
        && name[..idx].ends_with(|c: char| c.is_ascii_digit())
        && name[idx + 1..].chars().all(|c| c.is_ascii_digit())
        && !name[idx + 1..].is_empty()
    {
        return name[..idx].to_string();
    }
    name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string()
}

/// Parse `/proc/mdstat` into the array view.
pub fn parse_mdstat(raw: &str) -> Result<ArrayStatus, ProbeError> {
    let mut devices = Vec::new();
    let mut sync_action: Option<String> = None;
    let mut sync_progress: Option<f64> = None;

    let mut lines = raw.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();

        if let Some((name, rest)) = trimmed.split_once(" : ") {
            if !name.starts_with("md") {
                continue;
            }
            let mut parts = rest.split_whitespace();
            let state = parts.next().unwrap_or("inactive");
            let raid_level = parts
                .next()
                .filter(|p| p.starts_with("raid"))
                .unwrap_or("unknown")
                .to_string();
            let members: Vec<String> = rest
                .split_whitespace()
                .filter(|p| p.contains('['))
                .map(member_base_device)
                .collect();
            devices.push(MdDevice {
                name: name.to_string(),
                raid_level,
                active: state == "active",
                members,
            });
        } else if trimmed.contains('=')
            && (trimmed.contains("check")
                || trimmed.contains("resync")
                || trimmed.contains("recover"))
        {
            // e.g. `[=>...]  check = 8.5% (2498.../2930...) finish=214min`
            for action in ["check", "resync", "recover"] {
                if let Some(idx) = trimmed.find(&format!("{action} =")) {
                    let after = &trimmed[idx + action.len() + 2..];
                    let pct = after
                        .split_whitespace()
                        .next()
                        .and_then(|p| p.trim_end_matches('%').parse::<f64>().ok());
                    sync_action = Some(action.to_string());
                    sync_progress = pct;
                }
            }
        }
    }

    let any_active = devices.iter().any(|d| d.active);
    let state = match (&sync_action, any_active) {
        (Some(action), true) => match sync_progress {
            Some(pct) => format!("Started ({action} {pct:.1}%)"),
            None => format!("Started ({action})"),
        },
        (None, true) => "Started".to_string(),
        _ => "Stopped".to_string(),
    };

    Ok(ArrayStatus {
        state,
        devices,
        sync_action,
        sync_progress,
    })
}

/// Parse POSIX-format `df -P -B1` output, keeping real block devices.
pub fn parse_df(raw: &str) -> Result<Vec<FilesystemUsage>, ProbeError> {
    let mut filesystems = Vec::new();

    for line in raw.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || !fields[0].starts_with("/dev/") {
            continue;
        }

        let parse = |s: &str, what: &str| -> Result<u64, ProbeError> {
            s.parse().map_err(|err| {
                ProbeError::Parse(format!("df {what} field `{s}`: {err}"))
            })
        };
        let total_bytes = parse(fields[1], "total")?;
        let used_bytes = parse(fields[2], "used")?;
        let available_bytes = parse(fields[3], "available")?;

        filesystems.push(FilesystemUsage {
            filesystem: fields[0].to_string(),
            mount_point: fields[5].to_string(),
            total_bytes,
            used_bytes,
            available_bytes,
            usage_percent: if total_bytes == 0 {
                0.0
            } else {
                100.0 * used_bytes as f64 / total_bytes as f64
            },
        });
    }

    Ok(filesystems)
}

#[cfg(test)]
mod tests {
    use super::super::command::test_support;
    use super::*;

    const MDSTAT_CHECKING: &str = "\
Personalities : [raid6] [raid5] [raid4]
md0 : active raid6 sdd1[3] sdc1[2] sdb1[1] sda1[0]
      5860270080 blocks super 1.2 level 6, 512k chunk [4/4] [UUUU]
      [=>...................]  check =  8.5% (249862464/2930135040) finish=214.0min speed=208657K/sec

unused devices: <none>
";

    const MDSTAT_IDLE: &str = "\
Personalities : [raid1]
md0 : active raid1 sdb1[1] sda1[0]
      1048576 blocks [2/2] [UU]

unused devices: <none>
";

    const MDSTAT_EMPTY: &str = "\
Personalities :
unused devices: <none>
";

    const DF: &str = "\
Filesystem      1-blocks       Used  Available Capacity Mounted on
/dev/md0      5860270080 1172054016 4688216064      20% /mnt/disk1
/dev/nvme0n1p1 500000000  250000000  250000000      50% /mnt/cache
tmpfs            1000000          0    1000000       0% /dev/shm
";

    #[test]
    fn mdstat_checking_reports_action_and_progress() {
        let array = parse_mdstat(MDSTAT_CHECKING).unwrap();
        assert_eq!(array.state, "Started (check 8.5%)");
        assert_eq!(array.sync_action.as_deref(), Some("check"));
        assert!((array.sync_progress.unwrap() - 8.5).abs() < 0.01);
        assert_eq!(array.devices.len(), 1);
        assert_eq!(
            array.devices[0].members,
            vec!["sdd", "sdc", "sdb", "sda"]
        );
        assert_eq!(array.devices[0].raid_level, "raid6");
    }

    #[test]
    fn mdstat_idle_array_is_started() {
        let array = parse_mdstat(MDSTAT_IDLE).unwrap();
        assert_eq!(array.state, "Started");
        assert!(array.sync_action.is_none());
    }

    #[test]
    fn mdstat_without_devices_is_stopped() {
        let array = parse_mdstat(MDSTAT_EMPTY).unwrap();
        assert_eq!(array.state, "Stopped");
        assert!(array.devices.is_empty());
    }

    #[test]
    fn member_names_normalize_to_base_devices() {
        assert_eq!(member_base_device("sda1[0]"), "sda");
        assert_eq!(member_base_device("sdq[12]"), "sdq");
        assert_eq!(member_base_device("nvme0n1p2[1]"), "nvme0n1");
    }

    #[test]
    fn df_keeps_block_devices_only() {
        let filesystems = parse_df(DF).unwrap();
        assert_eq!(filesystems.len(), 2);
        let disk1 = &filesystems[0];
        assert_eq!(disk1.mount_point, "/mnt/disk1");
        assert!((disk1.usage_percent - 20.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn collect_absorbs_df_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mdstat"), MDSTAT_IDLE).unwrap();

        let runner = test_support::failing(1, "df: boom");
        let probe = StorageProbe::new(dir.path(), Arc::new(runner));

        let snapshot = probe.collect().await;
        assert_eq!(snapshot.array.unwrap().state, "Started");
        assert!(snapshot.filesystems.is_empty());
        assert!(snapshot.errors.contains_key("usage"));
    }

    #[tokio::test]
    async fn collect_assembles_both_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mdstat"), MDSTAT_CHECKING).unwrap();

        let runner = test_support::canned("df", DF);
        let probe = StorageProbe::new(dir.path(), Arc::new(runner));

        let snapshot = probe.collect().await;
        assert!(snapshot.errors.is_empty(), "{:?}", snapshot.errors);
        assert_eq!(snapshot.filesystems.len(), 2);
        assert!(snapshot.array.unwrap().state.starts_with("Started"));
    }
}
