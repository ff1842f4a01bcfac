//! Connection attempt handling
//!
//! One call to `handle_attempt` per attempt accepted from the virtual stack:
//! decide the route, open the far leg, hand the guest its endpoint and bridge
//! the pair.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::config::Config;
use crate::error::{ConnectionError, OutboundError, StackError};
use crate::io::{bridge, BoxedConn, CopyResult, StreamConn, DEFAULT_BUFFER_SIZE};
use crate::outbound::{Outbound, OverlayOutbound};
use crate::overlay::{write_port_header, PeerId};
use crate::route::{RouteDecision, RouteKind, Router};
use crate::stack::{AttemptId, ConnectAttempt};

/// Shared state for handling connection attempts
#[derive(Clone)]
pub struct AttemptContext {
    /// Routing policy
    pub router: Arc<Router>,

    /// Overlay leg for destinations claimed by a peer
    pub overlay: OverlayOutbound,

    /// Direct leg for everything else
    pub direct: Arc<dyn Outbound>,

    /// Bound on the direct dial
    pub direct_dial_timeout: Duration,

    /// Buffer size per bridge direction
    pub buffer_size: usize,
}

impl AttemptContext {
    /// Build a context using timeouts and buffer size from `config`
    pub fn from_config(
        config: &Config,
        router: Arc<Router>,
        overlay: OverlayOutbound,
        direct: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            router,
            overlay,
            direct,
            direct_dial_timeout: config.forwarder.direct_dial_timeout(),
            buffer_size: config.connection.buffer_size,
        }
    }
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptContext")
            .field("overlay", &self.overlay)
            .field("direct", &self.direct.tag())
            .field("direct_dial_timeout", &self.direct_dial_timeout)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

/// How a connection attempt ended
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Destination is reserved; the attempt was completed without forwarding
    Rejected,
    /// Both legs were established and bridged until they closed
    Bridged { route: RouteKind, copy: CopyResult },
    /// A leg could not be established; the attempt was abandoned
    Failed {
        route: RouteKind,
        error: ConnectionError,
    },
}

impl AttemptOutcome {
    /// Route taken, if the attempt was routed at all
    #[must_use]
    pub const fn route(&self) -> Option<RouteKind> {
        match self {
            Self::Rejected => None,
            Self::Bridged { route, .. } | Self::Failed { route, .. } => Some(*route),
        }
    }

    /// Whether the attempt reached the bridge
    #[must_use]
    pub const fn is_bridged(&self) -> bool {
        matches!(self, Self::Bridged { .. })
    }
}

/// Route one connection attempt and bridge it to its destination.
///
/// Never returns an error: every failure is local to the attempt and is
/// reported through `AttemptOutcome::Failed`. The attempt is always
/// completed before this returns.
pub async fn handle_attempt(
    attempt: Box<dyn ConnectAttempt>,
    ctx: &AttemptContext,
) -> AttemptOutcome {
    let id = attempt.id();
    let span = info_span!("attempt", local = %id.local, remote = %id.remote);
    route_attempt(attempt, id, ctx).instrument(span).await
}

async fn route_attempt(
    mut attempt: Box<dyn ConnectAttempt>,
    id: AttemptId,
    ctx: &AttemptContext,
) -> AttemptOutcome {
    match ctx.router.decide(&id) {
        RouteDecision::Reject => {
            attempt.complete(true);
            trace!("attempt to reserved destination completed without forwarding");
            AttemptOutcome::Rejected
        }
        RouteDecision::Overlay { peer, port } => {
            forward_overlay(attempt, id, &peer, port, ctx).await
        }
        RouteDecision::Direct { target, .. } => forward_direct(attempt, target, ctx).await,
    }
}

async fn forward_overlay(
    mut attempt: Box<dyn ConnectAttempt>,
    id: AttemptId,
    peer: &PeerId,
    port: u16,
    ctx: &AttemptContext,
) -> AttemptOutcome {
    let route = RouteKind::Overlay;

    let mut stream = match ctx.overlay.open(peer).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, "Failed to open overlay stream: {}", e);
            attempt.complete(true);
            return AttemptOutcome::Failed {
                route,
                error: e.into(),
            };
        }
    };

    if let Err(e) = write_port_header(&mut stream, port).await {
        error!(%peer, port, "Failed to write port header: {}", e);
        attempt.complete(true);
        return AttemptOutcome::Failed {
            route,
            error: e.into(),
        };
    }

    // Overlay leg is addressed as the guest talking to its destination
    let far = StreamConn::new(stream, id.remote, id.local);
    bridge_with_endpoint(attempt, Box::new(far), route, ctx.buffer_size).await
}

async fn forward_direct(
    mut attempt: Box<dyn ConnectAttempt>,
    target: SocketAddr,
    ctx: &AttemptContext,
) -> AttemptOutcome {
    let route = RouteKind::Direct;

    // The outbound is handed the timeout too, but is not relied on to honour it
    let dial = timeout(
        ctx.direct_dial_timeout,
        ctx.direct.connect(target, ctx.direct_dial_timeout),
    )
    .await
    .unwrap_or_else(|_| {
        Err(OutboundError::Timeout {
            addr: target,
            timeout_ms: u64::try_from(ctx.direct_dial_timeout.as_millis()).unwrap_or(u64::MAX),
        })
    });

    let far = match dial {
        Ok(conn) => conn,
        Err(e) => {
            debug!(%target, "Direct dial failed: {}", e);
            attempt.complete(true);
            return AttemptOutcome::Failed {
                route,
                error: e.into(),
            };
        }
    };

    bridge_with_endpoint(attempt, far, route, ctx.buffer_size).await
}

async fn bridge_with_endpoint(
    mut attempt: Box<dyn ConnectAttempt>,
    far: BoxedConn,
    route: RouteKind,
    buffer_size: usize,
) -> AttemptOutcome {
    let endpoint = attempt.create_endpoint().await;
    attempt.complete(false);

    let endpoint = match endpoint {
        Ok(endpoint) => endpoint,
        Err(e) => {
            match e {
                StackError::ConnectionRefused { .. } => {
                    debug!("Endpoint creation refused: {}", e);
                }
                _ => error!("Failed to create endpoint: {}", e),
            }
            // far leg is dropped (closed) here
            return AttemptOutcome::Failed {
                route,
                error: e.into(),
            };
        }
    };

    let buffer_size = if buffer_size == 0 {
        DEFAULT_BUFFER_SIZE
    } else {
        buffer_size
    };

    let result = bridge(endpoint, far, buffer_size).await;
    match result.error {
        None => {
            debug!(
                %route,
                up = result.bytes.a_to_b,
                down = result.bytes.b_to_a,
                "bridge closed"
            );
        }
        Some(ref e) => {
            debug!(%route, "bridge ended with error: {}", e);
        }
    }

    AttemptOutcome::Bridged {
        route,
        copy: result.bytes,
    }
}
