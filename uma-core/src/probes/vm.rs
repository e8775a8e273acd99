//! Virtual machine inventory via `virsh list --all`.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ProbeError;
use crate::types::{VmInfo, VmSnapshot};

use super::command::CommandRunner;

/// Table rows look like ` 1    win11    running` or ` -    arch    shut off`.
static ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+|-)\s+(\S+)\s+(.+?)\s*$").expect("static regex")
});

pub struct VirshProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for VirshProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirshProbe").field("bin", &self.bin).finish()
    }
}

impl VirshProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self) -> Result<VmSnapshot, ProbeError> {
        let args = ["list".to_string(), "--all".to_string()];
        let output = self
            .runner
            .run(&self.bin, &args)
            .await?
            .require_success(&self.bin)?;
        parse_virsh_list(&output.stdout)
    }
}

pub fn parse_virsh_list(raw: &str) -> Result<VmSnapshot, ProbeError> {
    let mut machines = Vec::new();

    // Skip the two header lines (column names and the dashed rule).
    for line in raw.lines().skip(2).filter(|l| !l.trim().is_empty()) {
        let caps = ROW.captures(line).ok_or_else(|| {
            ProbeError::Parse(format!("virsh list row `{line}`"))
        })?;
        let id = match &caps[1] {
            "-" => None,
            digits => Some(digits.parse::<i64>().map_err(|err| {
                ProbeError::Parse(format!("virsh id `{digits}`: {err}"))
            })?),
        };
        machines.push(VmInfo {
            id,
            name: caps[2].to_string(),
            // Multi-word states like `shut off` are normalized with a dash.
            state: caps[3].trim().replace(' ', "-"),
        });
    }

    machines.sort_by(|a, b| a.name.cmp(&b.name));
    let running = machines.iter().filter(|m| m.state == "running").count();
    Ok(VmSnapshot {
        running,
        total: machines.len(),
        machines,
    })
}

#[cfg(test)]
mod tests {
    use super::super::command::test_support;
    use super::*;

    const VIRSH_OUTPUT: &str = "\
 Id   Name      State
----------------------------
 1    win11     running
 -    archvm    shut off

";

    #[test]
    fn parses_running_and_shut_off_rows() {
        let snapshot = parse_virsh_list(VIRSH_OUTPUT).unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.running, 1);

        let arch = &snapshot.machines[0];
        assert_eq!(arch.name, "archvm");
        assert_eq!(arch.id, None);
        assert_eq!(arch.state, "shut-off");

        let win = &snapshot.machines[1];
        assert_eq!(win.id, Some(1));
        assert_eq!(win.state, "running");
    }

    #[test]
    fn empty_table_is_empty_snapshot() {
        let snapshot =
            parse_virsh_list(" Id   Name   State\n--------------------\n\n")
                .unwrap();
        assert_eq!(snapshot.total, 0);
    }

    #[tokio::test]
    async fn collect_invokes_virsh() {
        let runner = test_support::canned("virsh", VIRSH_OUTPUT);
        let probe = VirshProbe::new(Arc::new(runner), "virsh");
        let snapshot = probe.collect().await.unwrap();
        assert_eq!(snapshot.total, 2);
    }
}
