use axum::extract::State;
use axum::response::Response;

use uma_core::types::{Namespace, keys};

use crate::state::AppState;

use super::cached_read;

pub async fn get_interfaces(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Network, keys::NETWORK_INTERFACES).await
}
