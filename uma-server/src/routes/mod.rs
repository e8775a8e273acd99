pub mod v2;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all versions.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v2", v2::create_v2_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
