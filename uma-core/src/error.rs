use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failure of a single leaf probe. Absorbed at the collector boundary: the
/// previous cached value stays visible and an error counter increments.
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::Unavailable(err.to_string()),
            _ => Self::Command(err.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("probe failure: {0}")]
    Probe(#[from] ProbeError),

    #[error("no live value for {namespace}:{key}")]
    CacheMiss { namespace: String, key: String },

    #[error("operation conflicts with running operation {conflicting_id}")]
    OperationConflict { conflicting_id: Uuid },

    #[error("operation limit reached: {active} active")]
    OperationLimitExceeded { active: usize },

    #[error("unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("operation not found: {0}")]
    OperationNotFound(Uuid),

    #[error("operation {0} is not cancellable")]
    NotCancellable(Uuid),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code carried in API envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Probe(_) => "probe_failure",
            Self::CacheMiss { .. } => "cache_miss",
            Self::OperationConflict { .. } => "operation_conflict",
            Self::OperationLimitExceeded { .. } => "operation_limit_exceeded",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::OperationNotFound(_) => "operation_not_found",
            Self::NotCancellable(_) => "not_cancellable",
            Self::Cancelled => "cancelled",
            Self::TimedOut(_) => "timed_out",
            Self::RateLimited { .. } => "rate_limited",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
