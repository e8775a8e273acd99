use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};
use uuid::Uuid;

use uma_core::CoreError;

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn list_operations(State(state): State<AppState>) -> Json<Value> {
    let operations = state.core.operations().list();
    Json(json!({
        "status": "ok",
        "operations": operations,
        "active": state.core.operations().active_count(),
    }))
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let record = state
        .core
        .operations()
        .get(id)
        .ok_or(CoreError::OperationNotFound(id))
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "status": "ok", "operation": record })))
}

pub async fn cancel_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let record = state
        .core
        .operations()
        .cancel(id)
        .map_err(ApiError::from)?;
    Ok(Json(json!({
        "status": "accepted",
        "operation_id": record.id,
    })))
}
