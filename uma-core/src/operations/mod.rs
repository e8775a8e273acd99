//! Async operation management.
//!
//! User-initiated long-running jobs (parity checks, bulk container actions)
//! are tracked in an in-memory registry with conflict detection, admission
//! control, per-operation cancellation, and a timeout. Executors run on
//! isolated tasks: a panicking executor fails its operation and nothing
//! else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus, EventSource, topics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ParityCheck,
    ParityCorrect,
    ArrayStart,
    ArrayStop,
    SystemReboot,
    SystemShutdown,
    ContainerStart,
    ContainerStop,
    BulkContainerStart,
    BulkContainerStop,
    ScriptExecute,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParityCheck => "parity_check",
            Self::ParityCorrect => "parity_correct",
            Self::ArrayStart => "array_start",
            Self::ArrayStop => "array_stop",
            Self::SystemReboot => "system_reboot",
            Self::SystemShutdown => "system_shutdown",
            Self::ContainerStart => "container_start",
            Self::ContainerStop => "container_stop",
            Self::BulkContainerStart => "bulk_container_start",
            Self::BulkContainerStop => "bulk_container_stop",
            Self::ScriptExecute => "script_execute",
        }
    }

    /// Mutual-exclusion group, if any. Any two members of one group conflict.
    pub fn conflict_group(&self) -> Option<ConflictGroup> {
        match self {
            Self::ParityCheck
            | Self::ParityCorrect
            | Self::ArrayStart
            | Self::ArrayStop => Some(ConflictGroup::ArrayExclusive),
            Self::SystemReboot | Self::SystemShutdown => {
                Some(ConflictGroup::PowerExclusive)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictGroup {
    ArrayExclusive,
    PowerExclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Registry view of one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub status: OperationStatus,
    /// 0–100.
    pub progress: u8,
    pub description: String,
    pub created_by: String,
    pub cancellable: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Exactly one of `result`/`error` is set in a terminal state
    /// (`Cancelled` sets neither's payload beyond the error note).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A submission from the control surface.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub op_type: OperationType,
    pub params: Value,
    pub description: String,
    pub cancellable: bool,
    pub requester: String,
}

/// Handed to executors: parameters, the cancellation signal, and a progress
/// reporter.
pub struct OperationContext {
    pub id: Uuid,
    pub params: Value,
    pub cancel: CancellationToken,
    progress: ProgressHandle,
}

impl OperationContext {
    /// Report progress in percent; clamped, ignored once terminal.
    pub fn report_progress(&self, percent: u8) {
        self.progress.set(percent.min(100));
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext").field("id", &self.id).finish()
    }
}

#[derive(Clone)]
struct ProgressHandle {
    operations: Arc<Mutex<HashMap<Uuid, OperationEntry>>>,
    id: Uuid,
}

impl ProgressHandle {
    fn set(&self, percent: u8) {
        let mut operations = self.operations.lock();
        if let Some(entry) = operations.get_mut(&self.id)
            && entry.record.status == OperationStatus::Running
        {
            entry.record.progress = percent;
        }
    }
}

#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, ctx: OperationContext) -> Result<Value>;
}

struct OperationEntry {
    record: OperationRecord,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

pub struct AsyncOperationManager {
    operations: Arc<Mutex<HashMap<Uuid, OperationEntry>>>,
    executors: RwLock<HashMap<OperationType, Arc<dyn OperationExecutor>>>,
    bus: EventBus,
    max_concurrent: usize,
    timeout: Duration,
    retention: chrono::Duration,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AsyncOperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperationManager")
            .field("operations", &self.operations.lock().len())
            .field("executors", &self.executors.read().len())
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

impl AsyncOperationManager {
    pub fn new(
        bus: EventBus,
        cfg: &uma_config::OperationsConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            operations: Arc::new(Mutex::new(HashMap::new())),
            executors: RwLock::new(HashMap::new()),
            bus,
            max_concurrent: cfg.max_concurrent,
            timeout: Duration::from_secs(cfg.timeout_secs),
            retention: chrono::Duration::hours(cfg.retention_hours as i64),
            shutdown,
        }
    }

    pub fn register_executor(
        &self,
        op_type: OperationType,
        executor: Arc<dyn OperationExecutor>,
    ) {
        self.executors.write().insert(op_type, executor);
    }

    /// Submit a new operation. Checks, in order: executor availability, the
    /// conflict table, the admission cap. On success the operation is
    /// recorded as Pending and its worker spawned.
    pub fn submit(self: &Arc<Self>, request: OperationRequest) -> Result<OperationRecord> {
        let executor = self
            .executors
            .read()
            .get(&request.op_type)
            .cloned()
            .ok_or_else(|| {
                CoreError::UnknownOperation(request.op_type.to_string())
            })?;

        let (record, cancel) = {
            let mut operations = self.operations.lock();

            if let Some(group) = request.op_type.conflict_group() {
                if let Some(conflicting) = operations.values().find(|entry| {
                    entry.record.status.is_active()
                        && entry.record.op_type.conflict_group() == Some(group)
                }) {
                    return Err(CoreError::OperationConflict {
                        conflicting_id: conflicting.record.id,
                    });
                }
            }

            let active = operations
                .values()
                .filter(|entry| entry.record.status.is_active())
                .count();
            if active >= self.max_concurrent {
                return Err(CoreError::OperationLimitExceeded { active });
            }

            let id = Uuid::new_v4();
            let cancel = self.shutdown.child_token();
            let record = OperationRecord {
                id,
                op_type: request.op_type,
                status: OperationStatus::Pending,
                progress: 0,
                description: request.description.clone(),
                created_by: request.requester.clone(),
                cancellable: request.cancellable,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            };
            operations.insert(
                id,
                OperationEntry {
                    record: record.clone(),
                    cancel: cancel.clone(),
                    worker: None,
                },
            );
            (record, cancel)
        };

        info!(
            operation = %record.id,
            op_type = %record.op_type,
            requester = %record.created_by,
            "operation submitted"
        );

        let worker = self.clone().spawn_worker(
            record.id,
            record.op_type,
            request.params,
            executor,
            cancel,
        );
        if let Some(entry) = self.operations.lock().get_mut(&record.id) {
            entry.worker = Some(worker);
        }

        Ok(record)
    }

    fn spawn_worker(
        self: Arc<Self>,
        id: Uuid,
        op_type: OperationType,
        params: Value,
        executor: Arc<dyn OperationExecutor>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.transition_running(id);

            let ctx = OperationContext {
                id,
                params,
                cancel: cancel.clone(),
                progress: ProgressHandle {
                    operations: self.operations.clone(),
                    id,
                },
            };

            // The executor gets its own task so a panic is contained and
            // surfaces as a JoinError here.
            let mut execution = tokio::spawn(async move { executor.execute(ctx).await });

            let outcome = tokio::select! {
                joined = &mut execution => match joined {
                    Ok(Ok(result)) => Outcome::Completed(result),
                    Ok(Err(err)) => {
                        if matches!(err, CoreError::Cancelled) {
                            Outcome::Cancelled
                        } else {
                            Outcome::Failed(err.to_string())
                        }
                    }
                    Err(join_err) if join_err.is_panic() => {
                        Outcome::Failed(panic_message(join_err))
                    }
                    Err(join_err) => Outcome::Failed(join_err.to_string()),
                },
                _ = cancel.cancelled() => {
                    // Give the executor a moment to observe cancellation.
                    let _ =
                        tokio::time::timeout(Duration::from_secs(5), &mut execution)
                            .await;
                    Outcome::Cancelled
                }
                _ = tokio::time::sleep(self.timeout) => {
                    cancel.cancel();
                    let _ =
                        tokio::time::timeout(Duration::from_secs(5), &mut execution)
                            .await;
                    Outcome::Failed(format!(
                        "timed out after {:?}",
                        self.timeout
                    ))
                }
            };

            self.finalize(id, op_type, outcome);
        })
    }

    fn transition_running(&self, id: Uuid) {
        let record = {
            let mut operations = self.operations.lock();
            let Some(entry) = operations.get_mut(&id) else {
                return;
            };
            entry.record.status = OperationStatus::Running;
            entry.record.started_at = Some(Utc::now());
            entry.record.clone()
        };
        self.publish_lifecycle(topics::OPERATION_STARTED, &record);
    }

    fn finalize(&self, id: Uuid, op_type: OperationType, outcome: Outcome) {
        let record = {
            let mut operations = self.operations.lock();
            let Some(entry) = operations.get_mut(&id) else {
                return;
            };
            // Terminal states are final; a late timeout must not overwrite
            // an already-cancelled operation.
            if entry.record.status.is_terminal() {
                return;
            }
            match outcome {
                Outcome::Completed(result) => {
                    entry.record.status = OperationStatus::Completed;
                    entry.record.progress = 100;
                    entry.record.result = Some(result);
                }
                Outcome::Failed(message) => {
                    entry.record.status = OperationStatus::Failed;
                    entry.record.error = Some(message);
                }
                Outcome::Cancelled => {
                    entry.record.status = OperationStatus::Cancelled;
                    entry.record.error = Some("cancelled by request".to_string());
                }
            }
            entry.record.finished_at = Some(Utc::now());
            entry.record.clone()
        };

        let topic = match record.status {
            OperationStatus::Completed => topics::OPERATION_COMPLETED,
            OperationStatus::Cancelled => topics::OPERATION_CANCELLED,
            _ => topics::OPERATION_FAILED,
        };
        info!(
            operation = %id,
            op_type = %op_type,
            status = ?record.status,
            "operation finished"
        );
        self.publish_lifecycle(topic, &record);

        // Parity completion is also a storage domain event so the
        // invalidation router refreshes disk state.
        if record.status == OperationStatus::Completed
            && matches!(
                op_type,
                OperationType::ParityCheck | OperationType::ParityCorrect
            )
        {
            self.bus.publish(Event::new(
                EventSource::Storage,
                topics::PARITY_CHECK_COMPLETED,
                json!({ "operation_id": id }),
            ));
        }
    }

    fn publish_lifecycle(&self, topic: &str, record: &OperationRecord) {
        self.bus.publish(Event::new(
            EventSource::Operation,
            topic,
            json!({
                "operation_id": record.id,
                "type": record.op_type,
                "status": record.status,
                "progress": record.progress,
            }),
        ));
    }

    /// Cancel an operation. Allowed only for cancellable operations that are
    /// still Pending or Running.
    pub fn cancel(&self, id: Uuid) -> Result<OperationRecord> {
        let (cancel, record) = {
            let operations = self.operations.lock();
            let entry = operations
                .get(&id)
                .ok_or(CoreError::OperationNotFound(id))?;
            if !entry.record.cancellable || entry.record.status.is_terminal() {
                return Err(CoreError::NotCancellable(id));
            }
            (entry.cancel.clone(), entry.record.clone())
        };

        debug!(operation = %id, "cancellation requested");
        cancel.cancel();
        Ok(record)
    }

    pub fn get(&self, id: Uuid) -> Option<OperationRecord> {
        self.operations
            .lock()
            .get(&id)
            .map(|entry| entry.record.clone())
    }

    /// All known operations, newest first.
    pub fn list(&self) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self
            .operations
            .lock()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub fn active_count(&self) -> usize {
        self.operations
            .lock()
            .values()
            .filter(|entry| entry.record.status.is_active())
            .count()
    }

    /// Delete terminal operations older than the retention window.
    pub fn sweep_finished(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut operations = self.operations.lock();
        let before = operations.len();
        operations.retain(|_, entry| {
            !(entry.record.status.is_terminal()
                && entry.record.finished_at.is_some_and(|at| at < cutoff))
        });
        before - operations.len()
    }

    /// Periodic registry cleanup, supervised like every other worker.
    pub fn spawn_janitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("operation janitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = manager.sweep_finished();
                        if removed > 0 {
                            debug!(removed, "operation janitor removed finished records");
                        }
                    }
                }
            }
        })
    }

    /// Cancel everything in flight and join workers with a grace period.
    pub async fn stop(&self) {
        let workers: Vec<(Uuid, JoinHandle<()>)> = {
            let mut operations = self.operations.lock();
            operations
                .iter_mut()
                .filter_map(|(id, entry)| entry.worker.take().map(|w| (*id, w)))
                .collect()
        };
        self.shutdown.cancel();
        for (id, worker) in workers {
            if tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .is_err()
            {
                warn!(operation = %id, "worker did not stop within grace period");
            }
        }
    }
}

enum Outcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(message) = payload.downcast_ref::<&str>() {
                format!("executor panicked: {message}")
            } else if let Some(message) = payload.downcast_ref::<String>() {
                format!("executor panicked: {message}")
            } else {
                "executor panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct SleepExecutor {
        duration: Duration,
    }

    #[async_trait]
    impl OperationExecutor for SleepExecutor {
        async fn execute(&self, ctx: OperationContext) -> Result<Value> {
            tokio::select! {
                _ = tokio::time::sleep(self.duration) => Ok(json!({"done": true})),
                _ = ctx.cancel.cancelled() => Err(CoreError::Cancelled),
            }
        }
    }

    struct PanicExecutor;

    #[async_trait]
    impl OperationExecutor for PanicExecutor {
        async fn execute(&self, _ctx: OperationContext) -> Result<Value> {
            panic!("boom in executor");
        }
    }

    fn manager() -> Arc<AsyncOperationManager> {
        manager_with(uma_config::OperationsConfig::default())
    }

    fn manager_with(cfg: uma_config::OperationsConfig) -> Arc<AsyncOperationManager> {
        let manager = Arc::new(AsyncOperationManager::new(
            EventBus::new(64),
            &cfg,
            CancellationToken::new(),
        ));
        manager.register_executor(
            OperationType::ParityCheck,
            Arc::new(SleepExecutor {
                duration: Duration::from_secs(30),
            }),
        );
        manager.register_executor(
            OperationType::ArrayStart,
            Arc::new(SleepExecutor {
                duration: Duration::from_secs(30),
            }),
        );
        manager.register_executor(
            OperationType::ContainerStart,
            Arc::new(SleepExecutor {
                duration: Duration::from_millis(20),
            }),
        );
        manager
    }

    fn request(op_type: OperationType) -> OperationRequest {
        OperationRequest {
            op_type,
            params: json!({}),
            description: format!("test {op_type}"),
            cancellable: true,
            requester: "tests".to_string(),
        }
    }

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let manager = manager();
        let record = manager.submit(request(OperationType::ContainerStart)).unwrap();
        assert_eq!(record.status, OperationStatus::Pending);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let finished = manager.get(record.id).unwrap();
        assert_eq!(finished.status, OperationStatus::Completed);
        assert_eq!(finished.progress, 100);
        assert!(finished.result.is_some());
        assert!(finished.error.is_none());
    }

    #[tokio::test]
    async fn conflicting_submission_names_the_running_operation() {
        let manager = manager();
        let first = manager.submit(request(OperationType::ParityCheck)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = manager
            .submit(request(OperationType::ArrayStart))
            .unwrap_err();
        match err {
            CoreError::OperationConflict { conflicting_id } => {
                assert_eq!(conflicting_id, first.id);
            }
            other => panic!("expected conflict, got {other}"),
        }

        // Unrelated type is admitted.
        manager.submit(request(OperationType::ContainerStart)).unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancel_transitions_to_cancelled() {
        let manager = manager();
        let record = manager.submit(request(OperationType::ParityCheck)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.cancel(record.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancelled = manager.get(record.id).unwrap();
        assert_eq!(cancelled.status, OperationStatus::Cancelled);

        // A terminal operation rejects further cancels.
        assert!(matches!(
            manager.cancel(record.id),
            Err(CoreError::NotCancellable(_))
        ));
    }

    #[tokio::test]
    async fn non_cancellable_operation_rejects_cancel() {
        let manager = manager();
        let mut req = request(OperationType::ParityCheck);
        req.cancellable = false;
        let record = manager.submit(req).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            manager.cancel(record.id),
            Err(CoreError::NotCancellable(_))
        ));
        manager.stop().await;
    }

    #[tokio::test]
    async fn panicking_executor_fails_operation_and_manager_survives() {
        let manager = manager();
        manager.register_executor(OperationType::ScriptExecute, Arc::new(PanicExecutor));

        let record = manager.submit(request(OperationType::ScriptExecute)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let failed = manager.get(record.id).unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("boom"));

        // The manager still admits new work.
        manager.submit(request(OperationType::ContainerStart)).unwrap();
    }

    #[tokio::test]
    async fn timeout_fails_the_operation() {
        let cfg = uma_config::OperationsConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        // A zero-second timeout elapses immediately.
        let manager = manager_with(cfg);
        let record = manager.submit(request(OperationType::ParityCheck)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let finished = manager.get(record.id).unwrap();
        assert_eq!(finished.status, OperationStatus::Failed);
        assert!(finished.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn admission_cap_rejects_excess_submissions() {
        let cfg = uma_config::OperationsConfig {
            max_concurrent: 1,
            ..Default::default()
        };
        let manager = manager_with(cfg);
        manager.submit(request(OperationType::ParityCheck)).unwrap();

        let err = manager
            .submit(request(OperationType::ContainerStart))
            .unwrap_err();
        assert!(matches!(err, CoreError::OperationLimitExceeded { .. }));
        manager.stop().await;
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let manager = manager();
        let err = manager
            .submit(request(OperationType::SystemReboot))
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownOperation(_)));
    }

    #[tokio::test]
    async fn janitor_sweeps_old_terminal_records() {
        let cfg = uma_config::OperationsConfig {
            retention_hours: 0,
            ..Default::default()
        };
        let manager = manager_with(cfg);
        let record = manager.submit(request(OperationType::ContainerStart)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            manager.get(record.id).unwrap().status,
            OperationStatus::Completed
        );

        assert_eq!(manager.sweep_finished(), 1);
        assert!(manager.get(record.id).is_none());
    }

    #[tokio::test]
    async fn progress_reports_update_running_record() {
        struct ProgressExecutor(Arc<AtomicUsize>);

        #[async_trait]
        impl OperationExecutor for ProgressExecutor {
            async fn execute(&self, ctx: OperationContext) -> Result<Value> {
                ctx.report_progress(40);
                self.0.store(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(json!({}))
            }
        }

        let manager = manager();
        let reported = Arc::new(AtomicUsize::new(0));
        manager.register_executor(
            OperationType::ScriptExecute,
            Arc::new(ProgressExecutor(reported.clone())),
        );

        let record = manager.submit(request(OperationType::ScriptExecute)).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(manager.get(record.id).unwrap().progress, 40);
    }
}
