//! Shared configuration library for UMA.
//!
//! This crate centralizes config defaults, the layered loader (defaults →
//! optional TOML file → `UMA_`-prefixed environment variables), and startup
//! validation. The `uma-server` binary re-exports these utilities so there is
//! a single source of truth for config keys and guard rails.

pub mod loader;
pub mod models;

pub use loader::{ConfigError, load};
pub use models::{
    CacheSettings, Config, McpConfig, OperationsConfig, ProbesConfig,
    RateLimitSettings, SchedulerConfig, ServerConfig,
};
