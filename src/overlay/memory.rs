//! In-process overlay transport
//!
//! Nodes joined to the same `MemoryOverlayHub` can open streams to each other
//! by peer id. Each stream is a tokio duplex pipe; the accepting node's handler
//! for the protocol runs on a spawned task. Used to run the forwarder without
//! a network, and by the integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::traits::{OverlayStream, OverlayTransport, PeerId, StreamHandler};
use crate::error::OverlayError;

/// Pipe capacity of each in-memory stream
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Shared rendezvous point for in-memory overlay nodes
#[derive(Default)]
pub struct MemoryOverlayHub {
    nodes: DashMap<PeerId, Arc<NodeHandlers>>,
}

#[derive(Default)]
struct NodeHandlers {
    handlers: RwLock<HashMap<String, Arc<dyn StreamHandler>>>,
}

impl NodeHandlers {
    fn get(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.handlers.read().get(protocol).cloned()
    }
}

impl MemoryOverlayHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node with identity `peer`
    ///
    /// Joining twice with the same id replaces the earlier node.
    pub fn join(self: &Arc<Self>, peer: PeerId) -> MemoryOverlay {
        let handlers = Arc::new(NodeHandlers::default());
        self.nodes.insert(peer.clone(), Arc::clone(&handlers));
        debug!(%peer, "memory overlay node joined");
        MemoryOverlay {
            local: peer,
            hub: Arc::clone(self),
            handlers,
            opened: AtomicU64::new(0),
        }
    }

    /// Detach `peer`; later opens to it fail as unreachable
    pub fn leave(&self, peer: &PeerId) {
        self.nodes.remove(peer);
    }

    /// Number of attached nodes
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// One node on a `MemoryOverlayHub`
pub struct MemoryOverlay {
    local: PeerId,
    hub: Arc<MemoryOverlayHub>,
    handlers: Arc<NodeHandlers>,
    opened: AtomicU64,
}

impl MemoryOverlay {
    /// Number of streams this node has opened
    #[must_use]
    pub fn streams_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOverlay")
            .field("local", &self.local)
            .field("streams_opened", &self.streams_opened())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OverlayTransport for MemoryOverlay {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn register_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers
            .handlers
            .write()
            .insert(protocol.to_owned(), handler);
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<OverlayStream, OverlayError> {
        let node = self
            .hub
            .nodes
            .get(peer)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OverlayError::unreachable(peer.as_str(), "not on hub"))?;

        let handler = node
            .get(protocol)
            .ok_or_else(|| OverlayError::ProtocolNotSupported {
                protocol: protocol.to_owned(),
            })?;

        let (ours, theirs) = tokio::io::duplex(STREAM_BUFFER_SIZE);
        let remote = self.local.clone();
        tokio::spawn(async move {
            handler.handle(Box::new(theirs), remote).await;
        });

        self.opened.fetch_add(1, Ordering::Relaxed);
        trace!(from = %self.local, to = %peer, protocol, "memory overlay stream opened");
        Ok(Box::new(ours))
    }
}
