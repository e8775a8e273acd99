use axum::extract::State;
use axum::response::Response;

use uma_core::types::{Namespace, keys};

use crate::state::AppState;

use super::cached_read;

pub async fn get_scripts(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::General, keys::SCRIPTS).await
}
