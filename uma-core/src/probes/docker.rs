//! Container inventory via the docker CLI.
//!
//! `docker ps -a --format '{{json .}}'` emits one JSON object per line; the
//! fields used here are stable across docker releases.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::ProbeError;
use crate::types::{ContainerInfo, DockerSnapshot};

use super::command::CommandRunner;

/// Line shape of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

pub struct DockerProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for DockerProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerProbe").field("bin", &self.bin).finish()
    }
}

impl DockerProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self) -> Result<DockerSnapshot, ProbeError> {
        let args = [
            "ps".to_string(),
            "-a".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let output = self
            .runner
            .run(&self.bin, &args)
            .await?
            .require_success(&self.bin)?;
        parse_ps_json(&output.stdout)
    }
}

pub fn parse_ps_json(raw: &str) -> Result<DockerSnapshot, ProbeError> {
    let mut containers = Vec::new();

    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: PsLine = serde_json::from_str(line).map_err(|err| {
            ProbeError::Parse(format!("docker ps line `{line}`: {err}"))
        })?;
        containers.push(ContainerInfo {
            id: parsed.id,
            // Multiple names are comma-joined; the first is canonical.
            name: parsed
                .names
                .split(',')
                .next()
                .unwrap_or_default()
                .to_string(),
            image: parsed.image,
            state: parsed.state,
            status: parsed.status,
        });
    }

    containers.sort_by(|a, b| a.name.cmp(&b.name));
    let running = containers.iter().filter(|c| c.state == "running").count();
    Ok(DockerSnapshot {
        running,
        total: containers.len(),
        containers,
    })
}

#[cfg(test)]
mod tests {
    use super::super::command::test_support;
    use super::*;

    const PS_OUTPUT: &str = r#"{"ID":"a1b2c3","Names":"plex","Image":"plexinc/pms-docker","State":"running","Status":"Up 3 hours"}
{"ID":"d4e5f6","Names":"redis","Image":"redis:7","State":"exited","Status":"Exited (0) 2 days ago"}
"#;

    #[test]
    fn parses_one_container_per_line() {
        let snapshot = parse_ps_json(PS_OUTPUT).unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.containers[0].name, "plex");
        assert_eq!(snapshot.containers[0].state, "running");
        assert_eq!(snapshot.containers[1].status, "Exited (0) 2 days ago");
    }

    #[test]
    fn empty_output_is_empty_snapshot() {
        let snapshot = parse_ps_json("").unwrap();
        assert_eq!(snapshot.total, 0);
    }

    #[test]
    fn garbage_line_is_parse_error() {
        let err = parse_ps_json("not-json\n").unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn collect_runs_docker_ps() {
        let runner = test_support::canned("docker", PS_OUTPUT);
        let probe = DockerProbe::new(Arc::new(runner), "docker");

        let snapshot = probe.collect().await.unwrap();
        assert_eq!(snapshot.total, 2);
    }

    #[tokio::test]
    async fn daemon_error_is_command_failure() {
        let runner =
            test_support::failing(1, "Cannot connect to the Docker daemon");
        let probe = DockerProbe::new(Arc::new(runner), "docker");

        let err = probe.collect().await.unwrap_err();
        assert!(matches!(err, ProbeError::Command(_)));
    }
}
