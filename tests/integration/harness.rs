//! Shared fixtures: an in-memory gateway and scripted outbounds

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tapgate::config::ConnectionConfig;
use tapgate::connection::{AttemptContext, ConnectionManager, ConnectionStats, InboundOverlayListener};
use tapgate::error::OutboundError;
use tapgate::io::BoxedConn;
use tapgate::outbound::{DirectOutbound, Outbound, OverlayOutbound};
use tapgate::overlay::{MemoryOverlay, MemoryOverlayHub, OverlayTransport, PeerId, StaticPeerRegistry};
use tapgate::route::{NatTable, ReservedRanges, Router};
use tapgate::stack::MemoryStack;

pub const PROTO: &str = "/gvisor/libp2p-tap-tcp/1.0.0";
pub const TAP_IP: &str = "192.168.127.1";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn peer(s: &str) -> PeerId {
    s.parse().unwrap()
}

/// One forwarder node: its own stack, NAT table and registry, joined to a hub
pub struct Gateway {
    pub id: PeerId,
    pub stack: Arc<MemoryStack>,
    pub overlay: Arc<MemoryOverlay>,
    pub nat: Arc<NatTable>,
    pub registry: Arc<StaticPeerRegistry>,
    pub stats: Arc<ConnectionStats>,
    pub ctx: AttemptContext,
}

impl Gateway {
    /// Join `hub` as `id`, serving inbound streams into a fresh stack
    pub fn join(hub: &Arc<MemoryOverlayHub>, id: &str, direct: Arc<dyn Outbound>) -> Self {
        let id = peer(id);
        let stack = MemoryStack::new();
        let overlay = Arc::new(hub.join(id.clone()));
        let stats = Arc::new(ConnectionStats::new());

        overlay.register_handler(
            PROTO,
            Arc::new(InboundOverlayListener::new(
                stack.clone(),
                TAP_IP,
                Duration::from_millis(500),
                stats.clone(),
            )),
        );

        let nat = Arc::new(NatTable::new());
        let registry = Arc::new(StaticPeerRegistry::new());
        let router = Arc::new(Router::new(
            ReservedRanges::link_local(),
            nat.clone(),
            registry.clone(),
        ));
        let ctx = AttemptContext {
            router,
            overlay: OverlayOutbound::new(overlay.clone(), PROTO, Duration::from_millis(500)),
            direct,
            direct_dial_timeout: Duration::from_millis(200),
            buffer_size: 4096,
        };

        Self {
            id,
            stack,
            overlay,
            nat,
            registry,
            stats,
            ctx,
        }
    }

    /// Join with a real direct outbound
    pub fn with_direct(hub: &Arc<MemoryOverlayHub>, id: &str) -> Self {
        Self::join(hub, id, Arc::new(DirectOutbound::default()))
    }

    /// Connection manager sharing this gateway's stats
    pub fn manager(&self, max_connections: usize) -> Arc<ConnectionManager> {
        let config = ConnectionConfig {
            max_connections,
            buffer_size: 4096,
            drain_timeout_secs: 1,
        };
        Arc::new(ConnectionManager::new(
            &config,
            self.ctx.clone(),
            self.stats.clone(),
        ))
    }
}

/// Poll `cond` until it holds or a second passes
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Records every dial target and refuses it
#[derive(Default)]
pub struct RecordingOutbound {
    targets: Mutex<Vec<SocketAddr>>,
}

impl RecordingOutbound {
    pub fn targets(&self) -> Vec<SocketAddr> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    fn tag(&self) -> &str {
        "recording"
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        _connect_timeout: Duration,
    ) -> Result<BoxedConn, OutboundError> {
        self.targets.lock().push(addr);
        Err(OutboundError::Refused { addr })
    }
}

/// Dials that never complete and ignore the timeout they are handed
#[derive(Default)]
pub struct HangingOutbound {
    pub dials: AtomicUsize,
}

impl HangingOutbound {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Outbound for HangingOutbound {
    fn tag(&self) -> &str {
        "hanging"
    }

    async fn connect(
        &self,
        _addr: SocketAddr,
        _connect_timeout: Duration,
    ) -> Result<BoxedConn, OutboundError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}
