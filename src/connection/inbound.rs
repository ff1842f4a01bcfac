//! Inbound overlay listener
//!
//! Serves streams opened by remote peers: read the port header, dial that
//! port on the gateway's tap-facing address inside the virtual stack, and
//! bridge. Each stream is independent; a failure abandons only that stream.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, error, info_span, warn, Instrument, Level};

use super::stats::ConnectionStats;
use crate::config::Config;
use crate::error::{ConnectionError, OverlayError, StackError};
use crate::io::{bridge, CopyResult, StreamConn, DEFAULT_BUFFER_SIZE};
use crate::overlay::{read_port_header, OverlayStream, PeerId, StreamHandler};
use crate::stack::VirtualStack;

/// Tap-facing address used when the configured one does not parse
pub const FALLBACK_TAP_IP: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Parse the tap-facing address, falling back to loopback with a warning
#[must_use]
pub fn resolve_tap_ip(configured: &str) -> Ipv4Addr {
    match configured.trim().parse::<Ipv4Addr>() {
        Ok(ip) => ip,
        Err(e) => {
            warn!(
                "Invalid tap IP '{}' ({}), falling back to {}",
                configured, e, FALLBACK_TAP_IP
            );
            FALLBACK_TAP_IP
        }
    }
}

/// `StreamHandler` for the forwarder protocol
pub struct InboundOverlayListener {
    stack: Arc<dyn VirtualStack>,
    tap_ip: Ipv4Addr,
    dial_timeout: Duration,
    buffer_size: usize,
    stats: Arc<ConnectionStats>,
}

impl InboundOverlayListener {
    /// Create a listener dialing `tap_ip` inside `stack`
    pub fn new(
        stack: Arc<dyn VirtualStack>,
        tap_ip: &str,
        dial_timeout: Duration,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            stack,
            tap_ip: resolve_tap_ip(tap_ip),
            dial_timeout,
            buffer_size: DEFAULT_BUFFER_SIZE,
            stats,
        }
    }

    /// Create a listener from the `tap`, `forwarder` and `connection` sections
    pub fn from_config(
        config: &Config,
        stack: Arc<dyn VirtualStack>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self::new(
            stack,
            &config.tap.tap_ip,
            config.forwarder.stack_dial_timeout(),
            stats,
        )
        .with_buffer_size(config.connection.buffer_size)
    }

    /// Set the bridge buffer size
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        if buffer_size > 0 {
            self.buffer_size = buffer_size;
        }
        self
    }

    /// Address dialed inside the virtual stack
    #[must_use]
    pub const fn tap_ip(&self) -> Ipv4Addr {
        self.tap_ip
    }

    /// Serve one overlay stream to completion.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Overlay` if the port header cannot be read
    /// and `ConnectionError::Stack` if the dial into the stack fails.
    pub async fn serve_stream(
        &self,
        mut stream: OverlayStream,
    ) -> Result<CopyResult, ConnectionError> {
        let port = read_port_header(&mut stream).await?;
        let target = SocketAddr::new(IpAddr::V4(self.tap_ip), port);

        // The kernel stack reads /proc on every call
        if tracing::enabled!(Level::DEBUG) {
            for route in self.stack.route_table() {
                debug!("stack route: {}", route);
            }
        }

        let local = match timeout(self.dial_timeout, self.stack.dial(target)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(StackError::Timeout {
                    addr: target,
                    timeout_ms: u64::try_from(self.dial_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                }
                .into())
            }
        };

        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let overlay = StreamConn::new(stream, target, unspecified);

        let result = bridge(local, overlay, self.buffer_size).await;
        if let Some(e) = result.error {
            debug!(%target, "inbound bridge ended with error: {}", e);
        }
        Ok(result.bytes)
    }
}

#[async_trait]
impl StreamHandler for InboundOverlayListener {
    async fn handle(&self, stream: OverlayStream, remote: PeerId) {
        self.stats.record_inbound_stream();

        let span = info_span!("overlay_stream", peer = %remote);
        let result = self.serve_stream(stream).instrument(span.clone()).await;

        let _enter = span.enter();
        match result {
            Ok(copy) => {
                self.stats.add_bytes(copy.a_to_b, copy.b_to_a);
                debug!(up = copy.b_to_a, down = copy.a_to_b, "inbound stream closed");
            }
            Err(e) => {
                self.stats.record_inbound_failed();
                match e {
                    ConnectionError::Overlay(OverlayError::ShortHeader { .. }) => {
                        warn!("Abandoning stream: {}", e);
                    }
                    ref e if e.is_transient() => {
                        debug!("Dial into stack failed: {}", e);
                    }
                    _ => error!("Inbound stream failed: {}", e),
                }
            }
        }
    }
}

impl std::fmt::Debug for InboundOverlayListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundOverlayListener")
            .field("tap_ip", &self.tap_ip)
            .field("dial_timeout", &self.dial_timeout)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}
