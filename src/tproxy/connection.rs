//! TPROXY connection representation
//!
//! An accepted guest connection together with the destination the guest
//! originally asked for.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::socket::get_original_dst;
use crate::error::TproxyError;
use crate::stack::AttemptId;

/// A TPROXY-redirected TCP connection
#[derive(Debug)]
pub struct TproxyConnection {
    /// The underlying TCP stream
    stream: TcpStream,

    /// Guest's source address
    client_addr: SocketAddr,

    /// Destination the guest connected to
    original_dst: SocketAddr,

    /// When the connection was accepted
    accepted_at: Instant,
}

impl TproxyConnection {
    /// Create a connection from an accepted stream.
    ///
    /// The destination is read with `SO_ORIGINAL_DST`; when the socket has
    /// none (plain TPROXY without conntrack), the socket's local address is
    /// the original destination.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::OriginalDstError` if neither source yields an
    /// address.
    pub fn new(stream: TcpStream, client_addr: SocketAddr) -> Result<Self, TproxyError> {
        let original_dst = match get_original_dst(stream.as_raw_fd()) {
            Ok(dst) => dst,
            Err(e) => {
                trace!("{}; using local address", e);
                stream
                    .local_addr()
                    .map_err(|e| TproxyError::OriginalDstError(e.to_string()))?
            }
        };

        debug!(
            "TPROXY connection: {} -> {} (original)",
            client_addr, original_dst
        );

        Ok(Self::with_destination(stream, client_addr, original_dst))
    }

    /// Create a connection with a pre-known destination.
    pub fn with_destination(
        stream: TcpStream,
        client_addr: SocketAddr,
        original_dst: SocketAddr,
    ) -> Self {
        Self {
            stream,
            client_addr,
            original_dst,
            accepted_at: Instant::now(),
        }
    }

    /// The attempt 4-tuple: original destination and guest source
    #[must_use]
    pub const fn attempt_id(&self) -> AttemptId {
        AttemptId {
            local: self.original_dst,
            remote: self.client_addr,
        }
    }

    /// Get the underlying TCP stream
    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Consume the connection and return the underlying stream
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Get the guest's source address
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Get the original destination address
    #[must_use]
    pub const fn original_dst(&self) -> SocketAddr {
        self.original_dst
    }

    /// Get the connection age
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.accepted_at.elapsed()
    }
}

impl AsRawFd for TproxyConnection {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.stream.as_raw_fd()
    }
}
