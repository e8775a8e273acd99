//! Control surface: POST endpoints that submit async operations.
//!
//! Every accepted submission returns `202 {status, operation_id, state}`.
//! Reboot and shutdown are wired but refuse with a forbidden-by-policy
//! marker; the daemon does not mutate host power state.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use uma_core::operations::{
    OperationRequest, OperationStatus, OperationType,
};

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

/// Requester recorded on operations submitted over the local API.
const LOCAL_REQUESTER: &str = "api";

fn submit(
    state: &AppState,
    op_type: OperationType,
    params: Value,
    description: String,
    cancellable: bool,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let record = state
        .core
        .operations()
        .submit(OperationRequest {
            op_type,
            params,
            description,
            cancellable,
            requester: LOCAL_REQUESTER.to_string(),
        })
        .map_err(ApiError::from)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "operation_id": record.id,
            "state": record.status,
        })),
    ))
}

pub async fn start_parity_check(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ParityCheck,
        json!({ "correct": false }),
        "Parity check".to_string(),
        true,
    )
}

pub async fn start_parity_correct(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ParityCorrect,
        json!({ "correct": true }),
        "Correcting parity check".to_string(),
        true,
    )
}

fn active_parity_operation(
    state: &AppState,
) -> Option<uma_core::operations::OperationRecord> {
    state.core.operations().list().into_iter().find(|op| {
        matches!(
            op.op_type,
            OperationType::ParityCheck | OperationType::ParityCorrect
        ) && matches!(
            op.status,
            OperationStatus::Pending | OperationStatus::Running
        )
    })
}

/// Stop cancels the in-flight parity operation.
pub async fn stop_parity(
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let active = active_parity_operation(&state)
        .ok_or_else(|| ApiError::not_found("no parity operation in flight"))?;
    state
        .core
        .operations()
        .cancel(active.id)
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "status": "accepted",
        "operation_id": active.id,
    })))
}

/// Pause is acknowledged but the md-level pause itself is left to the host
/// layer; the operation keeps running and resumes polling.
pub async fn pause_parity(
    State(state): State<AppState>,
) -> ApiResult<Json<Value>> {
    let active = active_parity_operation(&state)
        .ok_or_else(|| ApiError::not_found("no parity operation in flight"))?;
    Ok(Json(json!({
        "status": "accepted",
        "operation_id": active.id,
        "note": "pause requested",
    })))
}

pub async fn start_array(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ArrayStart,
        json!({}),
        "Start array".to_string(),
        false,
    )
}

pub async fn stop_array(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ArrayStop,
        json!({}),
        "Stop array".to_string(),
        false,
    )
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ContainerStart,
        json!({ "container": name }),
        format!("Start container {name}"),
        true,
    )
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ContainerStop,
        json!({ "container": name }),
        format!("Stop container {name}"),
        true,
    )
}

#[derive(Debug, Deserialize)]
pub struct BulkContainerRequest {
    pub containers: Vec<String>,
}

pub async fn bulk_start_containers(
    State(state): State<AppState>,
    Json(request): Json<BulkContainerRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.containers.is_empty() {
        return Err(ApiError::bad_request("containers list is empty"));
    }
    let count = request.containers.len();
    submit(
        &state,
        OperationType::BulkContainerStart,
        json!({ "containers": request.containers }),
        format!("Start {count} containers"),
        true,
    )
}

pub async fn bulk_stop_containers(
    State(state): State<AppState>,
    Json(request): Json<BulkContainerRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.containers.is_empty() {
        return Err(ApiError::bad_request("containers list is empty"));
    }
    let count = request.containers.len();
    submit(
        &state,
        OperationType::BulkContainerStop,
        json!({ "containers": request.containers }),
        format!("Stop {count} containers"),
        true,
    )
}

pub async fn execute_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    submit(
        &state,
        OperationType::ScriptExecute,
        json!({ "script": name }),
        format!("Execute user script {name}"),
        true,
    )
}

pub async fn reboot_system(State(_state): State<AppState>) -> ApiError {
    ApiError::forbidden_by_policy("system reboot is disabled by policy")
}

pub async fn shutdown_system(State(_state): State<AppState>) -> ApiError {
    ApiError::forbidden_by_policy("system shutdown is disabled by policy")
}
