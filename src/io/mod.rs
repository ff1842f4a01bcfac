//! I/O utilities for tapgate
//!
//! The duplex-connection abstraction shared by kernel sockets, overlay
//! streams and in-memory pipes, and the bridge that relays between two of
//! them.

mod conn;
mod copy;

pub use conn::{BoxedConn, ByteStream, DuplexConn, StreamConn};
pub use copy::{
    bidirectional_copy, bidirectional_copy_with_buffer, bridge, BridgeResult, CopyResult,
};

/// Default copy buffer size (64 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
