//! Operation executors wired into the async operation manager at startup.
//!
//! These are the host-mutation boundary. Container and script executors run
//! the real tools; array and parity executors drive the stubbed md layer:
//! the request is logged and progress is tracked by polling `/proc/mdstat`,
//! but no md command is issued.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use uma_core::CoreError;
use uma_core::operations::{
    AsyncOperationManager, OperationContext, OperationExecutor, OperationType,
};
use uma_core::probes::command::{CommandRunner, ShellCommandRunner};
use uma_core::probes::storage::StorageProbe;
use uma_core::scheduler::collectors::ProbeSet;

/// Scripts may legitimately run far longer than probe commands.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);

/// Cadence for watching parity progress in mdstat.
const PARITY_POLL_INTERVAL: Duration = Duration::from_secs(2);

fn param_str(params: &Value, key: &str) -> Result<String, CoreError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::Internal(format!("missing `{key}` parameter")))
}

struct ParityExecutor {
    storage: Arc<StorageProbe>,
    correcting: bool,
}

#[async_trait]
impl OperationExecutor for ParityExecutor {
    async fn execute(&self, ctx: OperationContext) -> uma_core::Result<Value> {
        info!(
            operation = %ctx.id,
            correcting = self.correcting,
            "parity run requested (md command issue left to the host layer)"
        );

        // Watch mdstat until the sync action drains or we are cancelled.
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(PARITY_POLL_INTERVAL) => {}
            }

            match self.storage.read_array().await {
                Ok(array) => match array.sync_progress {
                    Some(progress) if array.sync_action.is_some() => {
                        ctx.report_progress(progress.min(100.0) as u8);
                    }
                    _ => {
                        return Ok(json!({
                            "correcting": self.correcting,
                            "array_state": array.state,
                        }));
                    }
                },
                // mdstat unreadable: nothing to watch, consider the run done.
                Err(err) => {
                    return Ok(json!({
                        "correcting": self.correcting,
                        "note": format!("array state unavailable: {err}"),
                    }));
                }
            }
        }
    }
}

struct ArrayExecutor {
    start: bool,
}

#[async_trait]
impl OperationExecutor for ArrayExecutor {
    async fn execute(&self, ctx: OperationContext) -> uma_core::Result<Value> {
        info!(
            operation = %ctx.id,
            start = self.start,
            "array transition requested (md command issue left to the host layer)"
        );
        // The md transition itself is stubbed; model the settle time so the
        // operation is observably Running.
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(500)) => Ok(json!({
                "requested": if self.start { "start" } else { "stop" },
            })),
        }
    }
}

struct ContainerExecutor {
    runner: Arc<dyn CommandRunner>,
    docker_bin: String,
    action: &'static str,
}

impl ContainerExecutor {
    async fn run_action(&self, container: &str) -> uma_core::Result<Value> {
        let args = [self.action.to_string(), container.to_string()];
        let output = self
            .runner
            .run(&self.docker_bin, &args)
            .await
            .map_err(CoreError::Probe)?
            .require_success(&self.docker_bin)
            .map_err(CoreError::Probe)?;
        Ok(json!({
            "container": container,
            "output": output.stdout.trim(),
        }))
    }
}

#[async_trait]
impl OperationExecutor for ContainerExecutor {
    async fn execute(&self, ctx: OperationContext) -> uma_core::Result<Value> {
        let container = param_str(&ctx.params, "container")?;
        self.run_action(&container).await
    }
}

struct BulkContainerExecutor {
    runner: Arc<dyn CommandRunner>,
    docker_bin: String,
    action: &'static str,
}

#[async_trait]
impl OperationExecutor for BulkContainerExecutor {
    async fn execute(&self, ctx: OperationContext) -> uma_core::Result<Value> {
        let containers: Vec<String> = ctx
            .params
            .get("containers")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if containers.is_empty() {
            return Err(CoreError::Internal(
                "missing `containers` parameter".to_string(),
            ));
        }

        let single = ContainerExecutor {
            runner: self.runner.clone(),
            docker_bin: self.docker_bin.clone(),
            action: self.action,
        };

        let total = containers.len();
        let mut results = Vec::with_capacity(total);
        for (index, container) in containers.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            // Per-container failures are collected, not fatal: a bulk action
            // should touch every container it can.
            let outcome = match single.run_action(container).await {
                Ok(result) => result,
                Err(err) => json!({ "container": container, "error": err.to_string() }),
            };
            results.push(outcome);
            ctx.report_progress((100 * (index + 1) / total) as u8);
        }

        Ok(json!({ "results": results }))
    }
}

struct ScriptExecutor {
    runner: Arc<dyn CommandRunner>,
    scripts_dir: String,
}

#[async_trait]
impl OperationExecutor for ScriptExecutor {
    async fn execute(&self, ctx: OperationContext) -> uma_core::Result<Value> {
        let name = param_str(&ctx.params, "script")?;
        // Script names come from URL segments; refuse anything path-like.
        if name.contains('/') || name.contains("..") {
            return Err(CoreError::Internal(format!(
                "invalid script name `{name}`"
            )));
        }

        let path = format!("{}/{name}/script", self.scripts_dir);
        info!(operation = %ctx.id, script = %name, "executing user script");

        let args = [path];
        let output = self
            .runner
            .run("bash", &args)
            .await
            .map_err(CoreError::Probe)?;
        if !output.success() {
            return Err(CoreError::Internal(format!(
                "script `{name}` exited {}: {}",
                output.status,
                output.stderr.trim()
            )));
        }

        Ok(json!({
            "script": name,
            "output": output.stdout,
        }))
    }
}

/// Register the executor for every supported operation type. Reboot and
/// shutdown are deliberately absent: their routes refuse before submission.
pub fn register_default_executors(
    operations: &Arc<AsyncOperationManager>,
    probes: &Arc<ProbeSet>,
    cfg: &uma_config::ProbesConfig,
) {
    let probe_runner: Arc<dyn CommandRunner> = Arc::new(ShellCommandRunner::default());
    let script_runner: Arc<dyn CommandRunner> =
        Arc::new(ShellCommandRunner::new(SCRIPT_TIMEOUT));

    operations.register_executor(
        OperationType::ParityCheck,
        Arc::new(ParityExecutor {
            storage: probes.storage.clone(),
            correcting: false,
        }),
    );
    operations.register_executor(
        OperationType::ParityCorrect,
        Arc::new(ParityExecutor {
            storage: probes.storage.clone(),
            correcting: true,
        }),
    );
    operations.register_executor(
        OperationType::ArrayStart,
        Arc::new(ArrayExecutor { start: true }),
    );
    operations.register_executor(
        OperationType::ArrayStop,
        Arc::new(ArrayExecutor { start: false }),
    );
    operations.register_executor(
        OperationType::ContainerStart,
        Arc::new(ContainerExecutor {
            runner: probe_runner.clone(),
            docker_bin: cfg.docker_bin.clone(),
            action: "start",
        }),
    );
    operations.register_executor(
        OperationType::ContainerStop,
        Arc::new(ContainerExecutor {
            runner: probe_runner.clone(),
            docker_bin: cfg.docker_bin.clone(),
            action: "stop",
        }),
    );
    operations.register_executor(
        OperationType::BulkContainerStart,
        Arc::new(BulkContainerExecutor {
            runner: probe_runner.clone(),
            docker_bin: cfg.docker_bin.clone(),
            action: "start",
        }),
    );
    operations.register_executor(
        OperationType::BulkContainerStop,
        Arc::new(BulkContainerExecutor {
            runner: probe_runner,
            docker_bin: cfg.docker_bin.clone(),
            action: "stop",
        }),
    );
    operations.register_executor(
        OperationType::ScriptExecute,
        Arc::new(ScriptExecutor {
            runner: script_runner,
            scripts_dir: cfg.scripts_dir.clone(),
        }),
    );
}
