//! IPC Protocol definitions
//!
//! This module defines the command and response types used for
//! inter-process communication via Unix socket.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::connection::StatsSnapshot;
use crate::overlay::PeerId;
use crate::stack::Route;

/// IPC command types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Ping to check if the server is alive
    Ping,

    /// Get server status
    Status,

    /// Get forwarder statistics
    GetStats,

    /// Insert or replace a NAT entry
    NatSet {
        /// Virtual-stack address
        address: IpAddr,
        /// Host-reachable address dialed instead
        translated: IpAddr,
    },

    /// Remove a NAT entry
    NatDelete {
        /// Virtual-stack address
        address: IpAddr,
    },

    /// List NAT entries
    NatList,

    /// Record that a peer serves a virtual-stack address
    PeerClaim {
        /// Claimed address
        address: IpAddr,
        /// Claiming peer
        peer_id: PeerId,
    },

    /// Drop a peer claim
    PeerRelease {
        /// Claimed address
        address: IpAddr,
    },

    /// List peer claims
    PeerList,

    /// Get the virtual stack's routing table
    RouteTable,

    /// Initiate graceful shutdown
    Shutdown,
}

/// IPC response types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Ping response
    Pong,

    /// Status response
    Status(ServerStatus),

    /// Statistics response
    Stats(StatsSnapshot),

    /// NAT entries, sorted by address
    NatList { entries: Vec<NatEntry> },

    /// Peer claims, sorted by address
    PeerList { claims: Vec<PeerClaim> },

    /// Virtual stack routes
    RouteTable { routes: Vec<Route> },

    /// Success response (for commands that don't return data)
    Success {
        /// Optional message
        message: Option<String>,
    },

    /// Error response
    Error(ErrorInfo),
}

impl IpcResponse {
    /// Create a success response with no message
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    /// Create a success response with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success {
            message: Some(msg.into()),
        }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorInfo {
            code,
            message: message.into(),
        })
    }

    /// Check if this is an error response
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Server status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Server version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Local overlay identity
    pub local_peer: PeerId,
    /// Overlay protocol served and spoken
    pub protocol_id: String,
    /// Attempts in flight
    pub active_connections: u64,
    /// Attempts admitted since start
    pub total_connections: u64,
    /// Entries in the NAT table
    pub nat_entries: usize,
    /// Peer claims in the registry
    pub peer_claims: usize,
    /// Whether the server is accepting new connections
    pub accepting: bool,
    /// Whether shutdown is in progress
    pub shutting_down: bool,
}

/// One NAT table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatEntry {
    pub address: IpAddr,
    pub translated: IpAddr,
}

/// One peer claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClaim {
    pub address: IpAddr,
    pub peer_id: PeerId,
}

/// Error details carried by `IpcResponse::Error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code
    pub code: ErrorCode,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown error
    Unknown,
    /// Invalid command
    InvalidCommand,
    /// Invalid parameters
    InvalidParameters,
    /// Resource not found
    NotFound,
    /// Server is shutting down
    ShuttingDown,
    /// Internal error
    InternalError,
}

/// Message framing for IPC
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MB
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with length prefix
///
/// # Errors
///
/// Returns the serializer error, or an error if the message does not fit a
/// u32 length prefix.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len())
        .map_err(<serde_json::Error as serde::ser::Error>::custom)?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a message body (without its length prefix)
///
/// # Errors
///
/// Returns the deserializer error for malformed or unknown messages.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}
