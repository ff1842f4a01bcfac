//! Error types for tapgate
//!
//! Errors are grouped by subsystem. Every per-connection error is local to the
//! attempt that produced it: nothing in here is allowed to take the forwarder
//! down. `is_transient()` separates the expected network failures (refused,
//! timed out) from the unexpected ones so callers can pick a log severity.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for tapgate
#[derive(Debug, Error)]
pub enum TapgateError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TPROXY socket and listener errors
    #[error("TPROXY error: {0}")]
    Tproxy(#[from] TproxyError),

    /// Virtual network stack errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// Peer overlay transport errors
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    /// Direct dial errors
    #[error("Outbound error: {0}")]
    Outbound(#[from] OutboundError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Connection handling errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TapgateError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Tproxy(e) => e.is_recoverable(),
            Self::Stack(e) => e.is_recoverable(),
            Self::Overlay(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Connection(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// TPROXY-related errors
#[derive(Debug, Error)]
pub enum TproxyError {
    /// Failed to create socket
    #[error("Failed to create TPROXY socket: {0}")]
    SocketCreation(String),

    /// Failed to set socket option (`IP_TRANSPARENT`, etc.)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to accept connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// Failed to retrieve original destination
    #[error("Failed to get original destination: {0}")]
    OriginalDstError(String),

    /// Permission denied (`CAP_NET_ADMIN` required)
    #[error("Permission denied: TPROXY requires CAP_NET_ADMIN capability")]
    PermissionDenied,

    /// I/O error
    #[error("TPROXY I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TproxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation(_) | Self::SocketOption { .. } | Self::BindError { .. } => false,
            Self::AcceptError(_) | Self::OriginalDstError(_) => true,
            Self::PermissionDenied => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// Virtual network stack errors
///
/// Reported by `VirtualStack::accept`, `VirtualStack::dial` and
/// `ConnectAttempt::create_endpoint`.
#[derive(Debug, Error)]
pub enum StackError {
    /// The stack refused the connection (RST or nothing listening)
    #[error("Connection to {addr} refused")]
    ConnectionRefused { addr: SocketAddr },

    /// Dial did not complete in time
    #[error("Dial to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },

    /// The endpoint for an attempt could not be created
    #[error("Failed to create endpoint: {0}")]
    EndpointUnavailable(String),

    /// Failed to accept the next connection attempt
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// The stack has been shut down
    #[error("Virtual stack closed")]
    Closed,

    /// I/O error
    #[error("Stack I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl StackError {
    /// Refused and timed-out dials are expected on a live network
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } | Self::Timeout { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed => false,
            Self::AcceptError(_) => true,
            _ => self.is_transient(),
        }
    }

    /// Map a kernel connect error onto the stack taxonomy
    pub fn from_connect(addr: SocketAddr, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { addr },
            _ => Self::IoError(err),
        }
    }
}

/// Peer overlay transport errors
#[derive(Debug, Error)]
pub enum OverlayError {
    /// No transport address is known for this peer
    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: String },

    /// Peer identity failed validation
    #[error("Invalid peer id '{peer}': {reason}")]
    InvalidPeerId { peer: String, reason: String },

    /// Could not reach the peer
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    /// Remote does not speak the requested protocol
    #[error("Protocol not supported by remote: {protocol}")]
    ProtocolNotSupported { protocol: String },

    /// Opening the stream did not complete in time
    #[error("Opening stream to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: String, timeout_ms: u64 },

    /// Stream closed before the 2-byte port header was read
    #[error("Short port header: stream closed after {received} of 2 bytes")]
    ShortHeader { received: usize },

    /// Malformed stream negotiation
    #[error("Stream negotiation failed: {0}")]
    Negotiation(String),

    /// I/O error
    #[error("Overlay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl OverlayError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::UnknownPeer { .. }
            | Self::InvalidPeerId { .. }
            | Self::ProtocolNotSupported { .. } => false,
            Self::PeerUnreachable { .. } | Self::Timeout { .. } => true,
            Self::ShortHeader { .. } | Self::Negotiation(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a peer unreachable error
    pub fn unreachable(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PeerUnreachable {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Create a negotiation error
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Self::Negotiation(msg.into())
    }
}

/// Direct dial errors
#[derive(Debug, Error)]
pub enum OutboundError {
    /// Connection failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    /// Connection refused by the destination
    #[error("Connection to {addr} refused")]
    Refused { addr: SocketAddr },

    /// Connection timeout
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: SocketAddr, timeout_ms: u64 },

    /// Failed to set socket option
    #[error("Failed to set outbound socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// I/O error during connection
    #[error("Outbound I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl OutboundError {
    /// Refused and timed-out dials are expected on a live network
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Refused { .. } | Self::Timeout { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::SocketOption { .. } => false,
            Self::IoError(e) if e.kind() == io::ErrorKind::ConnectionReset => true,
            _ => self.is_transient(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr,
            reason: reason.into(),
        }
    }

    /// Map a kernel connect error onto the outbound taxonomy
    pub fn from_connect(addr: SocketAddr, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused { addr },
            io::ErrorKind::TimedOut => Self::Timeout {
                addr,
                timeout_ms: 0,
            },
            _ => Self::connection_failed(addr, err.to_string()),
        }
    }
}

/// IPC communication errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to create Unix socket
    #[error("Failed to create IPC socket at {path}: {reason}")]
    SocketCreation { path: String, reason: String },

    /// Failed to bind Unix socket
    #[error("Failed to bind IPC socket to {path}: {reason}")]
    BindError { path: String, reason: String },

    /// Connection error
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Protocol error (invalid message format)
    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SocketCreation { .. } | Self::BindError { .. } => false,
            Self::ConnectionError(_) | Self::ProtocolError(_) => true,
            Self::SerializationError(_) => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }
}

/// Connection handling errors
///
/// One of these ends exactly one attempt or one overlay stream.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Concurrency limit hit
    #[error("Connection limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },

    /// Shutdown in progress
    #[error("Forwarder is shutting down")]
    ShuttingDown,

    /// Virtual stack failure (endpoint creation, dial into the stack)
    #[error(transparent)]
    Stack(#[from] StackError),

    /// Overlay failure (open stream, header exchange)
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// Direct dial failure
    #[error(transparent)]
    Outbound(#[from] OutboundError),

    /// Copy error during bidirectional transfer
    #[error("Data transfer error: {0}")]
    TransferError(String),

    /// I/O error
    #[error("Connection I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ConnectionError {
    /// Whether the failure is an expected network condition (logged at debug)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Stack(e) => e.is_transient(),
            Self::Outbound(e) => e.is_transient(),
            Self::Overlay(OverlayError::Timeout { .. }) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LimitReached { .. } => true,
            Self::ShuttingDown => false,
            Self::Stack(e) => e.is_recoverable(),
            Self::Overlay(e) => e.is_recoverable(),
            Self::Outbound(e) => e.is_recoverable(),
            Self::TransferError(_) => false,
            Self::IoError(_) => self.is_transient(),
        }
    }

    /// Create a limit reached error
    pub const fn limit_reached(current: usize, max: usize) -> Self {
        Self::LimitReached { current, max }
    }

    /// Create a transfer error
    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferError(msg.into())
    }
}

/// Type alias for Result with `TapgateError`
pub type Result<T> = std::result::Result<T, TapgateError>;
