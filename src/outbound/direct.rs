//! Direct outbound implementation
//!
//! `DirectOutbound` dials the destination with the host kernel. Sockets are
//! built with `socket2` so TCP keepalive is armed before the handshake.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::traits::Outbound;
use crate::error::OutboundError;
use crate::io::BoxedConn;

/// Idle time before the first keepalive probe
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Interval between keepalive probes
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Direct outbound - connects straight to the destination
#[derive(Debug, Clone)]
pub struct DirectOutbound {
    tag: String,
    keepalive: Option<TcpKeepalive>,
}

impl DirectOutbound {
    /// Create a direct outbound with the default keepalive
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            keepalive: Some(
                TcpKeepalive::new()
                    .with_time(KEEPALIVE_TIME)
                    .with_interval(KEEPALIVE_INTERVAL),
            ),
        }
    }

    /// Disable TCP keepalive on dialed sockets
    #[must_use]
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive = None;
        self
    }

    fn create_socket(&self, addr: SocketAddr) -> Result<Socket, OutboundError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| OutboundError::SocketOption {
                option: "O_NONBLOCK".into(),
                reason: e.to_string(),
            })?;

        if let Some(ref keepalive) = self.keepalive {
            socket
                .set_tcp_keepalive(keepalive)
                .map_err(|e| OutboundError::SocketOption {
                    option: "TCP_KEEPALIVE".into(),
                    reason: e.to_string(),
                })?;
        }

        Ok(socket)
    }

    /// Dial `addr` and return the connected stream.
    ///
    /// # Errors
    ///
    /// Returns `OutboundError::Timeout` when the handshake does not finish in
    /// `connect_timeout`, `OutboundError::Refused` on RST, and
    /// `OutboundError::ConnectionFailed` otherwise.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<TcpStream, OutboundError> {
        let socket = self.create_socket(addr)?;

        // EINPROGRESS is expected for non-blocking sockets
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(OutboundError::from_connect(addr, &e)),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| OutboundError::connection_failed(addr, e.to_string()))?;

        let connected = timeout(connect_timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| OutboundError::from_connect(addr, &e))?;
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(OutboundError::from_connect(addr, &e)),
                Ok(None) => Ok(()),
            }
        })
        .await;

        match connected {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Direct connection to {} via {} established", addr, self.tag);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OutboundError::Timeout {
                addr,
                timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl Default for DirectOutbound {
    fn default() -> Self {
        Self::new("direct")
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<BoxedConn, OutboundError> {
        let stream = self.dial(addr, connect_timeout).await?;
        Ok(Box::new(stream))
    }
}
