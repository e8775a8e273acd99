//! Surface middleware: per-class rate limiting and slow-read logging.

use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use uma_core::ratelimit::{Admission, OperationClass};

use crate::state::AppState;

/// Read-path latency target; anything slower logs a warning.
const SLOW_READ_THRESHOLD_MS: u128 = 100;

/// Classify a request into its rate-limit cost class by route shape.
pub fn classify(method: &Method, path: &str) -> OperationClass {
    if path.ends_with("/health") {
        return OperationClass::HealthCheck;
    }
    if path.contains("/bulk/") {
        return OperationClass::Bulk;
    }
    if method == Method::POST
        && (path.contains("/parity/")
            || path.contains("/array/")
            || path.ends_with("/execute"))
    {
        return OperationClass::Expensive;
    }
    OperationClass::General
}

/// Identify the caller. The daemon trusts its local peer, so this is about
/// fairness between clients, not authentication.
fn client_id(req: &Request<Body>) -> String {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
    {
        let first = value.split(',').next().unwrap_or("unknown").trim();
        return format!("ip:{first}");
    }
    if let Some(addr) = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return format!("ip:{}", addr.0.ip());
    }
    "local".to_string()
}

/// Admission middleware for the `/api/v2` surface.
pub async fn rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let class = classify(req.method(), req.uri().path());
    let client = client_id(&req);

    match state.core.rate_limiter().check(&client, class) {
        Admission::Allowed => next.run(req).await,
        Admission::Denied { retry_after } => {
            let retry_secs = retry_after.as_secs().max(1);
            warn!(
                client = %client,
                class = class.as_str(),
                path = req.uri().path(),
                "rate limit exceeded"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_secs.to_string())],
                axum::Json(serde_json::json!({
                    "status": "error",
                    "error": {
                        "kind": "rate_limited",
                        "message": format!(
                            "too many requests; retry in {retry_secs}s"
                        ),
                        "details": { "retry_after": retry_secs },
                    }
                })),
            )
                .into_response()
        }
    }
}

/// Log reads that miss the latency target.
pub async fn slow_read_log(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let elapsed = started.elapsed().as_millis();
    if method == Method::GET && elapsed > SLOW_READ_THRESHOLD_MS {
        warn!(%method, path, elapsed_ms = elapsed as u64, "slow read request");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_and_bulk_and_expensive_classes() {
        assert_eq!(
            classify(&Method::GET, "/api/v2/system/health"),
            OperationClass::HealthCheck
        );
        assert_eq!(
            classify(&Method::POST, "/api/v2/docker/containers/bulk/start"),
            OperationClass::Bulk
        );
        assert_eq!(
            classify(&Method::POST, "/api/v2/storage/parity/start"),
            OperationClass::Expensive
        );
        assert_eq!(
            classify(&Method::POST, "/api/v2/scripts/backup/execute"),
            OperationClass::Expensive
        );
        assert_eq!(
            classify(&Method::GET, "/api/v2/docker/containers"),
            OperationClass::General
        );
    }

    #[test]
    fn forwarded_header_wins_for_client_identity() {
        let req = Request::builder()
            .uri("/api/v2/system/info")
            .header("x-forwarded-for", "192.168.1.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&req), "ip:192.168.1.7");

        let bare = Request::builder()
            .uri("/api/v2/system/info")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_id(&bare), "local");
    }
}
