//! MCP endpoint: JSON-RPC 2.0 over WebSocket.
//!
//! Implements `initialize`, `tools/list`, and `tools/call` against a static
//! registry of read tools, each backed by a cached read. Served on its own
//! listener when `mcp.enabled`.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, warn};

use uma_core::types::{Namespace, keys};

use crate::handlers::system::health_snapshot;
use crate::state::AppState;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// JSON-RPC error codes plus the MCP extensions.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const TOOL_NOT_FOUND: i64 = -32000;
pub const TOOL_ERROR: i64 = -32001;

/// Malformed frames tolerated before the connection is closed.
const PROTOCOL_STRIKE_LIMIT: u32 = 3;

/// What a tool reads when called.
enum ToolTarget {
    Cached(Namespace, &'static str),
    Health,
    SmartAggregate,
}

struct Tool {
    name: &'static str,
    description: &'static str,
    target: ToolTarget,
}

/// The static tool registry. All tools are reads with no parameters.
const TOOLS: &[Tool] = &[
    Tool {
        name: "get_system_info",
        description: "Host identity: hostname, kernel, cpu count, memory",
        target: ToolTarget::Cached(Namespace::System, keys::SYSTEM_INFO),
    },
    Tool {
        name: "get_system_metrics",
        description: "Current cpu, memory, load, and uptime",
        target: ToolTarget::Cached(Namespace::System, keys::SYSTEM_METRICS),
    },
    Tool {
        name: "get_system_health",
        description: "Daemon self-diagnostics and component counters",
        target: ToolTarget::Health,
    },
    Tool {
        name: "get_storage_usage",
        description: "Array state and per-filesystem usage",
        target: ToolTarget::Cached(Namespace::Storage, keys::DISK_USAGE),
    },
    Tool {
        name: "get_array_status",
        description: "md array state, members, and sync progress",
        target: ToolTarget::Cached(Namespace::Storage, keys::ARRAY_STATUS),
    },
    Tool {
        name: "get_containers",
        description: "Docker container inventory with states",
        target: ToolTarget::Cached(Namespace::Docker, keys::DOCKER_CONTAINERS),
    },
    Tool {
        name: "get_vms",
        description: "Libvirt virtual machine inventory with states",
        target: ToolTarget::Cached(Namespace::Vm, keys::VM_MACHINES),
    },
    Tool {
        name: "get_smart_data",
        description: "SMART health for the configured devices",
        target: ToolTarget::SmartAggregate,
    },
    Tool {
        name: "get_sensors",
        description: "Hardware temperature readings",
        target: ToolTarget::Cached(Namespace::Sensor, keys::SENSORS),
    },
    Tool {
        name: "get_ups_status",
        description: "UPS status, charge, load, and runtime",
        target: ToolTarget::Cached(Namespace::Sensor, keys::UPS),
    },
    Tool {
        name: "get_gpu_status",
        description: "GPU utilization, memory, and temperature",
        target: ToolTarget::Cached(Namespace::Sensor, keys::GPU),
    },
    Tool {
        name: "get_network_interfaces",
        description: "Network interface throughput",
        target: ToolTarget::Cached(Namespace::Network, keys::NETWORK_INTERFACES),
    },
];

/// Router served on the MCP listener.
pub fn mcp_router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", get(mcp_ws_handler))
        .with_state(state)
}

async fn mcp_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    debug!("mcp session connected");
    let (mut sender, mut receiver) = socket.split();
    let mut strikes = 0u32;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let (response, parse_failed) =
                    handle_raw(&state, text.as_str()).await;
                if parse_failed {
                    strikes += 1;
                    if strikes >= PROTOCOL_STRIKE_LIMIT {
                        warn!("closing mcp session after repeated protocol errors");
                        if let Some(response) = response {
                            let _ = sender
                                .send(Message::Text(response.to_string().into()))
                                .await;
                        }
                        break;
                    }
                }
                if let Some(response) = response
                    && sender
                        .send(Message::Text(response.to_string().into()))
                        .await
                        .is_err()
                {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "mcp socket error");
                break;
            }
        }
    }
    debug!("mcp session disconnected");
}

/// Parse one frame and dispatch. The second return marks a parse failure for
/// the strike counter.
async fn handle_raw(state: &AppState, raw: &str) -> (Option<Value>, bool) {
    match serde_json::from_str::<Value>(raw) {
        Ok(request) => (handle_request(state, request).await, false),
        Err(_) => (
            Some(error_response(Value::Null, PARSE_ERROR, "Parse error")),
            true,
        ),
    }
}

/// Dispatch a parsed JSON-RPC request. Notifications return `None`.
pub async fn handle_request(state: &AppState, request: Value) -> Option<Value> {
    let Some(obj) = request.as_object() else {
        return Some(error_response(
            Value::Null,
            INVALID_REQUEST,
            "Invalid request",
        ));
    };

    let id = obj.get("id").cloned();
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        return Some(error_response(
            id.unwrap_or(Value::Null),
            INVALID_REQUEST,
            "Invalid request",
        ));
    };

    // Notifications carry no id and expect no response.
    let Some(id) = id else {
        debug!(method, "mcp notification");
        return None;
    };

    let response = match method {
        "initialize" => result_response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "uma",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => {
            let tools: Vec<Value> = TOOLS
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": {
                            "type": "object",
                            "properties": {},
                            "required": [],
                        },
                    })
                })
                .collect();
            result_response(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(error_response(
                    id,
                    INVALID_PARAMS,
                    "missing tool name",
                ));
            };
            let Some(tool) = TOOLS.iter().find(|tool| tool.name == name) else {
                return Some(error_response(
                    id,
                    TOOL_NOT_FOUND,
                    format!("unknown tool {name}"),
                ));
            };
            call_tool(state, tool, id).await
        }
        _ => error_response(
            id,
            METHOD_NOT_FOUND,
            format!("method {method} not found"),
        ),
    };

    Some(response)
}

async fn call_tool(state: &AppState, tool: &Tool, id: Value) -> Value {
    let data = match &tool.target {
        ToolTarget::Health => Some(health_snapshot(state)),
        ToolTarget::Cached(namespace, key) => {
            read_cached(state, *namespace, key).await
        }
        ToolTarget::SmartAggregate => {
            let cache = state.core.cache();
            let mut devices = serde_json::Map::new();
            for device in &state.core.probes().smart_devices {
                let key = keys::smart_device(device);
                let value = cache
                    .get(Namespace::Smart, &key)
                    .map(|v| v.as_ref().clone())
                    .unwrap_or(Value::Null);
                devices.insert(key, value);
            }
            Some(json!({ "devices": devices }))
        }
    };

    match data {
        Some(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => result_response(
                id,
                json!({ "content": [{ "type": "text", "text": text }] }),
            ),
            Err(err) => error_response(id, TOOL_ERROR, err.to_string()),
        },
        None => result_response(
            id,
            json!({
                "content": [{
                    "type": "text",
                    "text": format!("no cached data for {}", tool.name),
                }],
                "isError": true,
            }),
        ),
    }
}

async fn read_cached(
    state: &AppState,
    namespace: Namespace,
    key: &str,
) -> Option<Value> {
    let cache = state.core.cache();
    if let Some(value) = cache.get(namespace, key) {
        return Some(value.as_ref().clone());
    }
    if state.core.scheduler().prime(namespace, key).await {
        return cache.get(namespace, key).map(|v| v.as_ref().clone());
    }
    None
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uma_core::supervisor::Supervisor;

    use super::*;

    fn test_state() -> AppState {
        let mut config = uma_config::Config::default();
        let dir = tempfile::tempdir().unwrap();
        config.probes.proc_root = dir.path().display().to_string();
        config.probes.smart_devices = vec!["/dev/sda".to_string()];
        // Supervisor is built but not started: no workers, manual cache.
        AppState::new(Arc::new(Supervisor::new(config)))
    }

    #[tokio::test]
    async fn initialize_reports_protocol_version() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }),
        )
        .await
        .unwrap();

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert!(response["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_includes_the_registry() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .await
        .unwrap();

        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), TOOLS.len());
        assert!(
            tools
                .iter()
                .any(|tool| tool["name"] == "get_system_metrics")
        );
    }

    #[tokio::test]
    async fn tools_call_returns_cached_text_content() {
        let state = test_state();
        state.core.cache().set(
            Namespace::Docker,
            keys::DOCKER_CONTAINERS,
            json!({ "total": 2, "running": 1, "containers": [] }),
        );

        let response = handle_request(
            &state,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "get_containers", "arguments": {} },
            }),
        )
        .await
        .unwrap();

        let content = &response["result"]["content"][0];
        assert_eq!(content["type"], "text");
        assert!(content["text"].as_str().unwrap().contains("\"total\": 2"));
        assert!(response["result"].get("isError").is_none());
    }

    #[tokio::test]
    async fn tools_call_cold_cache_is_tool_is_error() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "get_containers" },
            }),
        )
        .await
        .unwrap();

        assert_eq!(response["result"]["isError"], true);
    }

    #[tokio::test]
    async fn unknown_tool_is_32000() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": { "name": "get_flux_capacitor" },
            }),
        )
        .await
        .unwrap();

        assert_eq!(response["error"]["code"], TOOL_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({ "jsonrpc": "2.0", "id": 6, "method": "resources/list" }),
        )
        .await
        .unwrap();

        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_tool_name_is_32602() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": {},
            }),
        )
        .await
        .unwrap();

        assert_eq!(response["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn notification_gets_no_response() {
        let state = test_state();
        let response = handle_request(
            &state,
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        )
        .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn parse_error_is_32700() {
        let state = test_state();
        let (response, failed) = handle_raw(&state, "{not json").await;
        assert!(failed);
        assert_eq!(response.unwrap()["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn non_object_request_is_invalid() {
        let state = test_state();
        let response = handle_request(&state, json!([1, 2, 3])).await.unwrap();
        assert_eq!(response["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn smart_aggregate_reads_per_device_keys() {
        let state = test_state();
        state
            .core
            .cache()
            .set(Namespace::Smart, "sda", json!({ "healthy": true }));

        let response = handle_request(
            &state,
            json!({
                "jsonrpc": "2.0",
                "id": 8,
                "method": "tools/call",
                "params": { "name": "get_smart_data" },
            }),
        )
        .await
        .unwrap();

        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("sda"));
        assert!(text.contains("healthy"));
    }
}
