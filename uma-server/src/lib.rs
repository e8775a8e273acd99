//! # UMA Server
//!
//! HTTP, WebSocket, and MCP surface for the UMA host-monitoring daemon.
//!
//! ## Overview
//!
//! - **Read surface**: `/api/v2/…` endpoints serving cached snapshots with a
//!   `last_updated` envelope; reads never trigger probes except to prime a
//!   cache the scheduler has not yet filled
//! - **Control surface**: POST endpoints submitting async operations
//!   (parity, array, containers, user scripts)
//! - **Streaming**: `/api/v2/stream` pushes change-detector events to
//!   subscribed WebSocket clients
//! - **MCP**: a JSON-RPC 2.0 WebSocket advertising read tools to model
//!   clients, on its own listener
//!
//! The server binds loopback by default and assumes a trusted caller; there
//! is no authentication layer.

/// Versioned route organization
pub mod routes;

/// Request handlers
pub mod handlers;

/// Operation executors wired at startup
pub mod executors;

/// WebSocket streaming sessions
pub mod websocket;

/// MCP endpoint
pub mod mcp;

/// Middleware implementations
pub mod middleware;

/// Error types and handling
pub mod errors;

/// Shared application state
pub mod state;

pub use state::AppState;
