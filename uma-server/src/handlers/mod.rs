//! Request handlers for the `/api/v2` surface.
//!
//! Reads are cache lookups wrapped in a `{status, last_updated, data}`
//! envelope. A miss primes the owning collector once if it has never
//! produced a value (cold start); otherwise the miss surfaces as a 404-style
//! `unavailable` envelope and the scheduler refreshes the key on its own
//! cadence.

pub mod control;
pub mod docker;
pub mod hardware;
pub mod network;
pub mod operations;
pub mod scripts;
pub mod storage;
pub mod system;
pub mod vm;

use axum::Json;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use uma_core::CoreError;
use uma_core::types::Namespace;

use crate::errors::ApiError;
use crate::state::AppState;

pub(crate) fn ok_envelope(data: Value, last_updated: i64) -> Response {
    Json(json!({
        "status": "ok",
        "last_updated": last_updated,
        "data": data,
    }))
    .into_response()
}

/// Serve a cached snapshot, priming a never-produced key once.
pub(crate) async fn cached_read(
    state: &AppState,
    namespace: Namespace,
    key: &str,
) -> Response {
    let cache = state.core.cache();
    if let Some((value, created)) = cache.get_with_meta(namespace, key) {
        return ok_envelope(value.as_ref().clone(), created);
    }

    if state.core.scheduler().prime(namespace, key).await
        && let Some((value, created)) = cache.get_with_meta(namespace, key)
    {
        return ok_envelope(value.as_ref().clone(), created);
    }

    ApiError::from(CoreError::CacheMiss {
        namespace: namespace.to_string(),
        key: key.to_string(),
    })
    .into_response()
}
