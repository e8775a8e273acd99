//! Layered configuration loading.
//!
//! Precedence, lowest to highest: coded defaults (serde `default` impls) →
//! optional TOML file → `UMA_`-prefixed environment variables. Dotted keys
//! map to underscored env names (`mcp.enabled` → `UMA_MCP_ENABLED`); section
//! names are resolved by longest match so `UMA_RATE_LIMIT_BULK_LIMIT`
//! addresses `rate_limit.bulk_limit`.

use std::env;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::models::Config;

/// Section names recognized in env keys, longest first so `RATE_LIMIT_…`
/// resolves before a hypothetical `RATE_…`.
const SECTIONS: &[&str] = &[
    "rate_limit",
    "operations",
    "scheduler",
    "probes",
    "server",
    "cache",
    "mcp",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] config::ConfigError),

    #[error("unrecognized environment variable {0}")]
    UnknownKey(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load the full configuration, layering the optional file and environment
/// over defaults, then validate it.
pub fn load(file: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    builder = match file {
        Some(path) => builder.add_source(
            config::File::from(path).format(config::FileFormat::Toml),
        ),
        None => builder.add_source(
            config::File::with_name("/etc/uma/config")
                .format(config::FileFormat::Toml)
                .required(false),
        ),
    };

    for (key, value) in env_overrides()? {
        debug!(key, "applying environment override");
        builder = builder.set_override(key, value)?;
    }

    let cfg: Config = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Translate `UMA_*` environment variables into dotted config keys.
fn env_overrides() -> Result<Vec<(String, config::Value)>, ConfigError> {
    let mut overrides = Vec::new();

    for (name, value) in env::vars() {
        let Some(rest) = name.strip_prefix("UMA_") else {
            continue;
        };
        // Binary-level variables consumed by clap, not by this loader.
        if matches!(rest, "CONFIG_FILE" | "BIND_HOST" | "BIND_PORT") {
            continue;
        }
        let rest = rest.to_ascii_lowercase();

        let Some(section) = SECTIONS
            .iter()
            .find(|s| rest.strip_prefix(**s).is_some_and(|r| r.starts_with('_')))
        else {
            return Err(ConfigError::UnknownKey(name));
        };
        let field = &rest[section.len() + 1..];
        if field.is_empty() {
            return Err(ConfigError::UnknownKey(name));
        }

        let key = format!("{section}.{field}");
        // List-valued fields are passed comma-separated in the environment.
        let value = if field == "smart_devices" {
            config::Value::from(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            )
        } else {
            config::Value::from(value)
        };
        overrides.push((key, value));
    }

    Ok(overrides)
}

/// Startup guard rails. Violations are fatal before any worker spawns.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.mcp.enabled && cfg.mcp.port == cfg.server.port {
        return Err(ConfigError::Invalid(format!(
            "mcp.port {} conflicts with server.port",
            cfg.mcp.port
        )));
    }
    if cfg.cache.max_entries == 0 {
        return Err(ConfigError::Invalid(
            "cache.max_entries must be at least 1".to_string(),
        ));
    }
    if cfg.operations.max_concurrent == 0 {
        return Err(ConfigError::Invalid(
            "operations.max_concurrent must be at least 1".to_string(),
        ));
    }
    if cfg.scheduler.high_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.high_interval_secs must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;

    /// Serializes tests that read or mutate the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_load_without_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        let cfg = load(None).expect("defaults should load");
        assert_eq!(cfg.server.port, 34_600);
        assert_eq!(cfg.operations.max_concurrent, 100);
        assert!(cfg.mcp.enabled);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[server]\nport = 9000\n\n[cache]\nmax_entries = 50\n"
        )
        .unwrap();

        let cfg = load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.cache.max_entries, 50);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.scheduler.medium_interval_secs, 5);
    }

    #[test]
    fn port_clash_is_fatal() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "[server]\nport = 7000\n\n[mcp]\nport = 7000\n").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_keys_resolve_longest_section() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY: ENV_LOCK serializes all env access in this module.
        unsafe {
            env::set_var("UMA_RATE_LIMIT_BULK_LIMIT", "3");
            env::set_var("UMA_MCP_ENABLED", "false");
        }
        let cfg = load(None).unwrap();
        unsafe {
            env::remove_var("UMA_RATE_LIMIT_BULK_LIMIT");
            env::remove_var("UMA_MCP_ENABLED");
        }

        assert_eq!(cfg.rate_limit.bulk_limit, 3);
        assert!(!cfg.mcp.enabled);
    }

    #[test]
    fn smart_devices_split_on_commas() {
        let _guard = ENV_LOCK.lock().unwrap();
        // SAFETY: ENV_LOCK serializes all env access in this module.
        unsafe {
            env::set_var("UMA_PROBES_SMART_DEVICES", "/dev/sda, /dev/sdb");
        }
        let cfg = load(None).unwrap();
        unsafe {
            env::remove_var("UMA_PROBES_SMART_DEVICES");
        }

        assert_eq!(cfg.probes.smart_devices, vec!["/dev/sda", "/dev/sdb"]);
    }
}
