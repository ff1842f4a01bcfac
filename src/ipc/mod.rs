//! IPC (Inter-Process Communication) module
//!
//! This module provides a Unix socket-based IPC server for inspecting and
//! editing the gateway's NAT table and peer claims at runtime.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded command or response
//!
//! # Example
//!
//! ```no_run
//! use tapgate::ipc::IpcClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::new("/var/run/tapgate.sock");
//!
//! client
//!     .nat_set("192.168.127.254".parse()?, "127.0.0.1".parse()?)
//!     .await?;
//!
//! let status = client.status().await?;
//! println!("Active connections: {}", status.active_connections);
//! # Ok(())
//! # }
//! ```

mod client;
pub(crate) mod handler;
mod protocol;
mod server;

pub use client::IpcClient;
pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, ErrorCode, ErrorInfo, IpcCommand, IpcResponse, NatEntry,
    PeerClaim, ServerStatus, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::IpcServer;
