use axum::extract::State;
use axum::response::Response;

use uma_core::types::{Namespace, keys};

use crate::state::AppState;

use super::cached_read;

pub async fn get_ups_status(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Sensor, keys::UPS).await
}

pub async fn get_sensors(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Sensor, keys::SENSORS).await
}

pub async fn get_gpu_status(State(state): State<AppState>) -> Response {
    cached_read(&state, Namespace::Sensor, keys::GPU).await
}
