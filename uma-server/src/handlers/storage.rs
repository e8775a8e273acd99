use axum::extract::State;
use axum::response::Response;
use serde_json::{Map, Value, json};

use uma_core::operations::{OperationStatus, OperationType};
use uma_core::types::{Namespace, keys};

use crate::state::AppState;

use super::{cached_read, ok_envelope};

pub async fn get_storage_config(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Storage, keys::ARRAY_STATUS).await
}

pub async fn get_storage_layout(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Storage, keys::DISK_USAGE).await
}

pub async fn get_storage_usage(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Storage, keys::DISK_USAGE).await
}

pub async fn get_spindown_status(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Storage, keys::SPINDOWN).await
}

/// Aggregate SMART view across the configured devices. Absent devices map to
/// `null` so one unreadable disk does not hide the rest.
pub async fn get_smart_data(State(state): State<AppState>) -> Response {
    let devices = &state.core.probes().smart_devices;
    let cache = state.core.cache();

    let mut reports = Map::new();
    let mut last_updated = 0i64;
    for device in devices {
        let key = keys::smart_device(device);
        match cache.get_with_meta(Namespace::Smart, &key) {
            Some((value, created)) => {
                last_updated = last_updated.max(created);
                reports.insert(key, value.as_ref().clone());
            }
            None => {
                reports.insert(key, Value::Null);
            }
        }
    }

    ok_envelope(json!({ "devices": reports }), last_updated)
}

/// Parity view: the array's sync state plus any in-flight parity operation.
pub async fn get_parity_status(State(state): State<AppState>) -> Response {
    let cache = state.core.cache();
    let Some((array, created)) =
        cache.get_with_meta(Namespace::Storage, keys::ARRAY_STATUS)
    else {
        return cached_read(&state, Namespace::Storage, keys::ARRAY_STATUS).await;
    };

    let active_operation = state
        .core
        .operations()
        .list()
        .into_iter()
        .find(|op| {
            matches!(
                op.op_type,
                OperationType::ParityCheck | OperationType::ParityCorrect
            ) && matches!(
                op.status,
                OperationStatus::Pending | OperationStatus::Running
            )
        });

    let data = json!({
        "array": array.as_ref().clone(),
        "operation": active_operation,
    });
    ok_envelope(data, created)
}
