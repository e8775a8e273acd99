use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    handlers::{
        control, docker, hardware, network, operations, scripts, storage, system,
        vm,
    },
    middleware::{rate_limit, slow_read_log},
    state::AppState,
    websocket,
};

/// All v2 API routes: cached reads, control submissions, and the stream.
pub fn create_v2_router(state: AppState) -> Router<AppState> {
    Router::new()
        // Read surface
        .route("/system/info", get(system::get_system_info))
        .route("/system/metrics", get(system::get_system_metrics))
        .route("/system/health", get(system::get_system_health))
        .route("/storage/config", get(storage::get_storage_config))
        .route("/storage/layout", get(storage::get_storage_layout))
        .route("/storage/usage", get(storage::get_storage_usage))
        .route("/storage/smart", get(storage::get_smart_data))
        .route("/storage/parity", get(storage::get_parity_status))
        .route("/storage/spindown", get(storage::get_spindown_status))
        .route("/docker/containers", get(docker::get_containers))
        .route("/vm/machines", get(vm::get_machines))
        .route("/hardware/ups", get(hardware::get_ups_status))
        .route("/hardware/sensors", get(hardware::get_sensors))
        .route("/hardware/gpu", get(hardware::get_gpu_status))
        .route("/network/interfaces", get(network::get_interfaces))
        .route("/scripts", get(scripts::get_scripts))
        // Async operation registry
        .route("/operations", get(operations::list_operations))
        .route("/operations/{id}", get(operations::get_operation))
        .route("/operations/{id}/cancel", post(operations::cancel_operation))
        // Control surface
        .route("/storage/parity/start", post(control::start_parity_check))
        .route("/storage/parity/correct", post(control::start_parity_correct))
        .route("/storage/parity/stop", post(control::stop_parity))
        .route("/storage/parity/pause", post(control::pause_parity))
        .route("/storage/array/start", post(control::start_array))
        .route("/storage/array/stop", post(control::stop_array))
        .route(
            "/docker/containers/{name}/start",
            post(control::start_container),
        )
        .route(
            "/docker/containers/{name}/stop",
            post(control::stop_container),
        )
        .route(
            "/docker/containers/bulk/start",
            post(control::bulk_start_containers),
        )
        .route(
            "/docker/containers/bulk/stop",
            post(control::bulk_stop_containers),
        )
        .route("/scripts/{name}/execute", post(control::execute_script))
        .route("/system/reboot", post(control::reboot_system))
        .route("/system/shutdown", post(control::shutdown_system))
        // Streaming
        .route("/stream", get(websocket::stream_handler))
        .layer(middleware::from_fn(slow_read_log))
        .layer(middleware::from_fn_with_state(state, rate_limit))
}
