use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde_json::{Value, json};

use uma_core::types::{Namespace, keys};

use crate::state::AppState;

use super::cached_read;

pub async fn get_system_info(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::System, keys::SYSTEM_INFO).await
}

pub async fn get_system_metrics(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::System, keys::SYSTEM_METRICS).await
}

/// Daemon self-diagnostics: per-component counters rather than host metrics.
pub async fn get_system_health(State(state): State<AppState>) -> Json<Value> {
    Json(health_snapshot(&state))
}

/// Health payload, shared with the MCP `get_system_health` tool.
pub fn health_snapshot(state: &AppState) -> Value {
    let core = &state.core;
    let cache = core.cache().stats();
    let bus = core.bus();
    let collectors = core.scheduler().statuses();

    json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp(),
        "components": {
            "cache": cache,
            "event_bus": {
                "subscribers": bus.subscriber_count(),
                "published": bus.published_total(),
                "dropped": bus.dropped_total(),
            },
            "collectors": collectors,
            "operations": {
                "active": core.operations().active_count(),
            },
            "stream_sessions": {
                "connected": state.sessions.count(),
                "dropped_events": state.sessions.total_dropped(),
            },
        },
    })
}
