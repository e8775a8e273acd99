//! Subprocess invocation for tool probes.
//!
//! Every external tool (`smartctl`, `docker`, `virsh`, …) is reached through
//! the [`CommandRunner`] trait so probes can be tested against canned output.
//! The production runner enforces a short timeout; a hung tool must never
//! stall a collector cycle.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProbeError;

/// Default ceiling for a single tool invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Fail unless the tool exited zero.
    pub fn require_success(self, program: &str) -> Result<Self, ProbeError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProbeError::Command(format!(
                "{program} exited {}: {}",
                self.status,
                self.stderr.trim()
            )))
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, ProbeError>;
}

/// Production runner: spawns the tool with a timeout and captured pipes.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    timeout: Duration,
}

impl ShellCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, ProbeError> {
        debug!(program, ?args, "running probe command");

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    ProbeError::Unavailable(format!("{program} not installed"))
                } else {
                    ProbeError::Command(format!("spawning {program}: {err}"))
                }
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a mock runner that answers one program with fixed stdout.
    pub fn canned(program: &'static str, stdout: &'static str) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |p, _| p == program)
            .returning(move |_, _| {
                Ok(CommandOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    status: 0,
                })
            });
        runner
    }

    /// Build a mock runner whose program always fails with the given status.
    pub fn failing(status: i32, stderr: &'static str) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |_, _| {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                status,
            })
        });
        runner
    }
}
