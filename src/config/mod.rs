//! Configuration module for tapgate
//!
//! # Example
//!
//! ```no_run
//! use tapgate::config::load_config;
//!
//! let config = load_config("/etc/tapgate/config.json").unwrap();
//! println!("Protocol: {}", config.forwarder.protocol_id);
//! ```

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{
    ClaimConfig, Config, ConnectionConfig, ForwarderConfig, IpcConfig, LogConfig,
    NatEntryConfig, OverlayConfig, PeerConfig, TapConfig, DEFAULT_PROTOCOL_ID,
    MAX_PROTOCOL_ID_LENGTH,
};
