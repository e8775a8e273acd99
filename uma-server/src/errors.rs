use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use std::fmt;

use uma_core::CoreError;

pub type ApiResult<T> = Result<T, ApiError>;

/// API-facing error: an HTTP status, a stable kind code, a human-readable
/// message, and structured context for the details map.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub details: Map<String, Value>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        kind: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            details: Map::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn forbidden_by_policy(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden_by_policy", message)
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "status": "error",
            "error": {
                "kind": self.kind,
                "message": self.message,
                "details": self.details,
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        match err {
            CoreError::CacheMiss { namespace, key } => {
                Self::new(StatusCode::NOT_FOUND, kind, message)
                    .with_detail("namespace", json!(namespace))
                    .with_detail("key", json!(key))
            }
            CoreError::OperationConflict { conflicting_id } => {
                Self::new(StatusCode::CONFLICT, kind, message)
                    .with_detail("conflicting_operation", json!(conflicting_id))
            }
            CoreError::OperationLimitExceeded { active } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, kind, message)
                    .with_detail("active", json!(active))
            }
            CoreError::OperationNotFound(id) => {
                Self::new(StatusCode::NOT_FOUND, kind, message)
                    .with_detail("operation", json!(id))
            }
            CoreError::NotCancellable(id) => {
                Self::new(StatusCode::CONFLICT, kind, message)
                    .with_detail("operation", json!(id))
            }
            CoreError::UnknownOperation(_) => {
                Self::new(StatusCode::BAD_REQUEST, kind, message)
            }
            CoreError::RateLimited { retry_after_secs } => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, kind, message)
                    .with_detail("retry_after", json!(retry_after_secs))
            }
            CoreError::Protocol(_) => {
                Self::new(StatusCode::BAD_REQUEST, kind, message)
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, kind, message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn conflict_maps_to_409_with_conflicting_id() {
        let id = Uuid::new_v4();
        let api: ApiError = CoreError::OperationConflict {
            conflicting_id: id,
        }
        .into();
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.kind, "operation_conflict");
        assert_eq!(
            api.details["conflicting_operation"],
            json!(id.to_string())
        );
    }

    #[test]
    fn cache_miss_maps_to_404() {
        let api: ApiError = CoreError::CacheMiss {
            namespace: "system".to_string(),
            key: "metrics".to_string(),
        }
        .into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.kind, "cache_miss");
    }
}
