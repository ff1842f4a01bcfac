//! Configuration types for tapgate
//!
//! This module defines all configuration structures used by the forwarder.
//! Configuration is loaded from JSON files and validated at startup.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::overlay::PeerId;

/// Protocol identifier spoken on overlay streams carrying guest TCP
pub const DEFAULT_PROTOCOL_ID: &str = "/gvisor/libp2p-tap-tcp/1.0.0";

/// Maximum length of a protocol identifier (it is u8-length-prefixed on the wire)
pub const MAX_PROTOCOL_ID_LENGTH: usize = 255;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Tap-side listener and addressing
    #[serde(default)]
    pub tap: TapConfig,

    /// Forwarding policy and timeouts
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Peer overlay transport
    pub overlay: OverlayConfig,

    /// Initial NAT entries
    #[serde(default)]
    pub nat: Vec<NatEntryConfig>,

    /// Initial peer address claims
    #[serde(default)]
    pub claims: Vec<ClaimConfig>,

    /// Connection limits
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// IPC configuration
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tap.validate()?;
        self.forwarder.validate()?;
        self.overlay.validate()?;

        let mut nat_keys: HashSet<IpAddr> = HashSet::new();
        for entry in &self.nat {
            if !nat_keys.insert(entry.address) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate NAT entry for {}",
                    entry.address
                )));
            }
        }

        let peers: HashSet<&PeerId> = self.overlay.peers.iter().map(|p| &p.peer_id).collect();
        let mut claim_keys: HashSet<IpAddr> = HashSet::new();
        for claim in &self.claims {
            if !claim_keys.insert(claim.address) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate peer claim for {}",
                    claim.address
                )));
            }
            if !peers.contains(&claim.peer_id) {
                return Err(ConfigError::ValidationError(format!(
                    "Claim for {} references unknown peer: {}",
                    claim.address, claim.peer_id
                )));
            }
        }

        self.connection.validate()?;
        self.ipc.validate()?;

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            tap: TapConfig::default(),
            forwarder: ForwarderConfig::default(),
            overlay: OverlayConfig::default(),
            nat: Vec::new(),
            claims: Vec::new(),
            connection: ConnectionConfig::default(),
            ipc: IpcConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Tap-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TapConfig {
    /// TPROXY listen address for guest TCP (e.g., "127.0.0.1:7894")
    #[serde(default = "default_tap_listen")]
    pub listen: SocketAddr,

    /// Gateway's own address on the tap network
    ///
    /// Kept as a string: an unparsable value falls back to loopback at runtime.
    #[serde(default = "default_tap_ip")]
    pub tap_ip: String,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl TapConfig {
    /// Validate tap configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "tap.backlog must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            listen: default_tap_listen(),
            tap_ip: default_tap_ip(),
            backlog: default_backlog(),
        }
    }
}

/// Forwarding policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwarderConfig {
    /// Overlay protocol identifier used to register the handler and open streams
    #[serde(default = "default_protocol_id")]
    pub protocol_id: String,

    /// Destinations in these subnets are rejected without forwarding
    #[serde(default = "default_reserved_subnets")]
    pub reserved_subnets: Vec<IpNet>,

    /// Direct dial timeout in milliseconds
    #[serde(default = "default_direct_dial_timeout_ms")]
    pub direct_dial_timeout_ms: u64,

    /// Overlay stream open timeout in milliseconds
    #[serde(default = "default_overlay_open_timeout_ms")]
    pub overlay_open_timeout_ms: u64,

    /// Timeout for dialing into the virtual stack in milliseconds
    #[serde(default = "default_stack_dial_timeout_ms")]
    pub stack_dial_timeout_ms: u64,
}

impl ForwarderConfig {
    /// Validate forwarder configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol_id.is_empty() || !self.protocol_id.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "forwarder.protocol_id must start with '/': {:?}",
                self.protocol_id
            )));
        }
        if self.protocol_id.len() > MAX_PROTOCOL_ID_LENGTH {
            return Err(ConfigError::ValidationError(format!(
                "forwarder.protocol_id exceeds {MAX_PROTOCOL_ID_LENGTH} bytes"
            )));
        }

        for (name, value) in [
            ("direct_dial_timeout_ms", self.direct_dial_timeout_ms),
            ("overlay_open_timeout_ms", self.overlay_open_timeout_ms),
            ("stack_dial_timeout_ms", self.stack_dial_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "forwarder.{name} must be greater than 0"
                )));
            }
        }

        Ok(())
    }

    /// Get direct dial timeout as Duration
    #[must_use]
    pub const fn direct_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_dial_timeout_ms)
    }

    /// Get overlay open timeout as Duration
    #[must_use]
    pub const fn overlay_open_timeout(&self) -> Duration {
        Duration::from_millis(self.overlay_open_timeout_ms)
    }

    /// Get stack dial timeout as Duration
    #[must_use]
    pub const fn stack_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.stack_dial_timeout_ms)
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            protocol_id: default_protocol_id(),
            reserved_subnets: default_reserved_subnets(),
            direct_dial_timeout_ms: default_direct_dial_timeout_ms(),
            overlay_open_timeout_ms: default_overlay_open_timeout_ms(),
            stack_dial_timeout_ms: default_stack_dial_timeout_ms(),
        }
    }
}

/// Peer overlay transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlayConfig {
    /// This node's peer identity
    pub peer_id: PeerId,

    /// Address accepting overlay streams from peers
    #[serde(default = "default_overlay_listen")]
    pub listen: SocketAddr,

    /// Known peers and their transport addresses
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Transport connect timeout in milliseconds
    #[serde(default = "default_overlay_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl OverlayConfig {
    /// Validate overlay configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "overlay.connect_timeout_ms must be greater than 0".into(),
            ));
        }

        let mut seen: HashSet<&PeerId> = HashSet::new();
        for peer in &self.peers {
            if peer.peer_id == self.peer_id {
                return Err(ConfigError::ValidationError(format!(
                    "overlay.peers must not contain the local peer id: {}",
                    peer.peer_id
                )));
            }
            if !seen.insert(&peer.peer_id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate overlay peer: {}",
                    peer.peer_id
                )));
            }
        }

        Ok(())
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            peer_id: PeerId::from_static("tapgate-local"),
            listen: default_overlay_listen(),
            peers: Vec::new(),
            connect_timeout_ms: default_overlay_connect_timeout_ms(),
        }
    }
}

/// A remote peer reachable over the overlay
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Peer identity
    pub peer_id: PeerId,

    /// Transport address of the peer
    pub address: SocketAddr,
}

/// Initial NAT table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct NatEntryConfig {
    /// Virtual-stack address
    pub address: IpAddr,

    /// Host-reachable address dialed instead
    pub translated: IpAddr,
}

/// Initial peer claim on a virtual-stack address
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClaimConfig {
    /// Virtual-stack address claimed by the peer
    pub address: IpAddr,

    /// Claiming peer
    pub peer_id: PeerId,
}

/// IPC server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Path to Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Socket file mode (octal, e.g., 0o660)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Enable IPC server
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    /// Validate IPC configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "IPC socket path cannot be empty when IPC is enabled".into(),
            ));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            enabled: true,
            max_message_size: default_max_message_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Connection limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Maximum concurrent attempts and overlay streams
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Buffer size for bidirectional copy
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Graceful shutdown drain timeout in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl ConnectionConfig {
    /// Validate connection limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "connection.max_connections must be greater than 0".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "connection.buffer_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get drain timeout as Duration
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

fn default_tap_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7894))
}

fn default_tap_ip() -> String {
    "192.168.127.1".into()
}

const fn default_backlog() -> u32 {
    1024
}

fn default_protocol_id() -> String {
    DEFAULT_PROTOCOL_ID.into()
}

fn default_reserved_subnets() -> Vec<IpNet> {
    vec![IpNet::V4(crate::route::LINK_LOCAL_V4)]
}

const fn default_direct_dial_timeout_ms() -> u64 {
    3000
}

const fn default_overlay_open_timeout_ms() -> u64 {
    10_000
}

const fn default_stack_dial_timeout_ms() -> u64 {
    10_000
}

fn default_overlay_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7895))
}

const fn default_overlay_connect_timeout_ms() -> u64 {
    5000
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/tapgate.sock")
}

const fn default_socket_mode() -> u32 {
    0o660
}

const fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "json".into()
}

const fn default_max_connections() -> usize {
    65536
}

const fn default_buffer_size() -> usize {
    64 * 1024
}

const fn default_drain_timeout_secs() -> u64 {
    30
}
