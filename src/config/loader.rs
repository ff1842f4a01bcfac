//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: peer={}, {} overlay peers, {} NAT entries, {} claims",
        config.overlay.peer_id,
        config.overlay.peers.len(),
        config.nat.len(),
        config.claims.len()
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TAPGATE_LISTEN_ADDR`: Override the TPROXY listen address
/// - `TAPGATE_TAP_IP`: Override the tap-facing address
/// - `TAPGATE_LOG_LEVEL`: Override log level
/// - `TAPGATE_MAX_CONNECTIONS`: Override max connections
/// - `TAPGATE_IPC_SOCKET`: Override IPC socket path
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from a variable lookup and re-validate
pub(crate) fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("TAPGATE_LISTEN_ADDR") {
        config.tap.listen = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "TAPGATE_LISTEN_ADDR".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Listen address overridden to {}", config.tap.listen);
    }

    if let Some(ip) = lookup("TAPGATE_TAP_IP") {
        config.tap.tap_ip = ip;
        debug!("Tap IP overridden to {}", config.tap.tap_ip);
    }

    if let Some(level) = lookup("TAPGATE_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(max) = lookup("TAPGATE_MAX_CONNECTIONS") {
        config.connection.max_connections = max.parse().map_err(|_| ConfigError::EnvError {
            name: "TAPGATE_MAX_CONNECTIONS".into(),
            reason: format!("Invalid number: {max}"),
        })?;
        debug!(
            "Max connections overridden to {}",
            config.connection.max_connections
        );
    }

    if let Some(socket) = lookup("TAPGATE_IPC_SOCKET") {
        config.ipc.socket_path = socket.into();
        debug!("IPC socket path overridden to {:?}", config.ipc.socket_path);
    }

    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
