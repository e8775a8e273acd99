//! Disk power state via `hdparm -C`.
//!
//! One invocation per device; a probe failure on one disk marks that disk
//! `unknown` instead of failing the snapshot, since spun-down disks are the
//! interesting case and `hdparm` errors are common on USB bridges.

use std::sync::Arc;

use futures::future::join_all;

use crate::error::ProbeError;
use crate::types::{DiskPowerState, SpindownSnapshot};

use super::command::CommandRunner;

pub struct SpindownProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for SpindownProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpindownProbe")
            .field("bin", &self.bin)
            .finish()
    }
}

impl SpindownProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self, devices: &[String]) -> SpindownSnapshot {
        let checks = devices.iter().map(|device| async move {
            let args = ["-C".to_string(), device.clone()];
            let state = match self.runner.run(&self.bin, &args).await {
                Ok(output) if output.success() => parse_hdparm_state(&output.stdout),
                _ => "unknown".to_string(),
            };
            DiskPowerState {
                device: device.clone(),
                state,
            }
        });

        SpindownSnapshot {
            disks: join_all(checks).await,
        }
    }
}

/// Extract the state from `drive state is:  active/idle`.
pub fn parse_hdparm_state(raw: &str) -> String {
    raw.lines()
        .find_map(|line| {
            let (_, state) = line.split_once("drive state is:")?;
            Some(state.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::super::command::{CommandOutput, MockCommandRunner};
    use super::*;
    use crate::error::ProbeError;

    const HDPARM_ACTIVE: &str = "\n/dev/sda:\n drive state is:  active/idle\n";
    const HDPARM_STANDBY: &str = "\n/dev/sdb:\n drive state is:  standby\n";

    #[test]
    fn parses_drive_state_line() {
        assert_eq!(parse_hdparm_state(HDPARM_ACTIVE), "active/idle");
        assert_eq!(parse_hdparm_state(HDPARM_STANDBY), "standby");
        assert_eq!(parse_hdparm_state("garbage"), "unknown");
    }

    #[tokio::test]
    async fn collect_reports_each_device() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, args| {
            let stdout = if args[1] == "/dev/sdb" {
                HDPARM_STANDBY
            } else {
                HDPARM_ACTIVE
            };
            Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                status: 0,
            })
        });

        let probe = SpindownProbe::new(Arc::new(runner), "hdparm");
        let snapshot = probe
            .collect(&["/dev/sda".to_string(), "/dev/sdb".to_string()])
            .await;

        assert_eq!(snapshot.disks[0].state, "active/idle");
        assert_eq!(snapshot.disks[1].state, "standby");
    }

    #[tokio::test]
    async fn failed_device_reads_unknown() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Err(ProbeError::Command("io error".to_string()))
        });

        let probe = SpindownProbe::new(Arc::new(runner), "hdparm");
        let snapshot = probe.collect(&["/dev/sda".to_string()]).await;
        assert_eq!(snapshot.disks[0].state, "unknown");
    }
}
