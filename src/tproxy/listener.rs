//! TPROXY TCP Listener
//!
//! Accepts TPROXY-redirected guest connections with their original
//! destination.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use super::connection::TproxyConnection;
use super::socket::create_tproxy_tcp_socket;
use crate::config::TapConfig;
use crate::error::TproxyError;

/// A TPROXY TCP listener that accepts connections with original destination info
#[derive(Debug)]
pub struct TproxyListener {
    listener: TcpListener,
    listen_addr: SocketAddr,
}

impl TproxyListener {
    /// Create and bind a TPROXY listener for the tap configuration.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError` if socket creation or binding fails, or
    /// `CAP_NET_ADMIN` is missing.
    pub fn bind(config: &TapConfig) -> Result<Self, TproxyError> {
        info!("Creating TPROXY TCP listener on {}", config.listen);

        let socket = create_tproxy_tcp_socket()?;

        socket
            .bind(&config.listen.into())
            .map_err(|e| TproxyError::BindError {
                addr: config.listen,
                reason: e.to_string(),
            })?;

        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|e| TproxyError::socket_option("listen", e.to_string()))?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

        info!(
            "TPROXY TCP listener ready on {} (backlog={})",
            config.listen, config.backlog
        );

        Ok(Self::from_listener(listener, config.listen))
    }

    /// Wrap an already-bound listener.
    ///
    /// Used when redirection is done without TPROXY, and in tests.
    #[must_use]
    pub fn from_listener(listener: TcpListener, listen_addr: SocketAddr) -> Self {
        Self {
            listener,
            listen_addr,
        }
    }

    /// Accept a new TPROXY connection.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::AcceptError` if accept fails, or
    /// `TproxyError::OriginalDstError` if the destination cannot be read.
    pub async fn accept(&self) -> Result<TproxyConnection, TproxyError> {
        let (stream, client_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TproxyError::AcceptError(e.to_string()))?;

        debug!("Accepted connection from {}", client_addr);

        TproxyConnection::new(stream, client_addr)
    }

    /// Get the listen address.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}
