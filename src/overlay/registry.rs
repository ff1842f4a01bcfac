//! In-process peer registry
//!
//! Holds the address claims announced by peers. The forwarder only ever
//! performs point lookups through `PeerRegistry`; claims are added and
//! removed from configuration and the IPC control plane.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::debug;

use super::traits::{PeerId, PeerRegistry};

/// Address-claim registry backed by a hash map
#[derive(Debug, Default)]
pub struct StaticPeerRegistry {
    claims: RwLock<HashMap<IpAddr, PeerId>>,
}

impl StaticPeerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from initial claims
    pub fn with_claims(claims: impl IntoIterator<Item = (IpAddr, PeerId)>) -> Self {
        Self {
            claims: RwLock::new(claims.into_iter().collect()),
        }
    }

    /// Record that `peer` claims `addr`, returning the previous claimant
    pub fn claim(&self, addr: IpAddr, peer: PeerId) -> Option<PeerId> {
        debug!(%addr, %peer, "peer claim");
        self.claims.write().insert(addr, peer)
    }

    /// Drop the claim on `addr`, returning the claimant
    pub fn release(&self, addr: IpAddr) -> Option<PeerId> {
        let previous = self.claims.write().remove(&addr);
        if let Some(peer) = &previous {
            debug!(%addr, %peer, "peer claim released");
        }
        previous
    }

    /// Snapshot of all claims, ordered by address
    #[must_use]
    pub fn claims(&self) -> Vec<(IpAddr, PeerId)> {
        let mut claims: Vec<_> = self
            .claims
            .read()
            .iter()
            .map(|(addr, peer)| (*addr, peer.clone()))
            .collect();
        claims.sort_by_key(|(addr, _)| *addr);
        claims
    }

    /// Number of claims
    #[must_use]
    pub fn len(&self) -> usize {
        self.claims.read().len()
    }

    /// Whether there are no claims
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.claims.read().is_empty()
    }
}

impl PeerRegistry for StaticPeerRegistry {
    fn lookup_peer_by_addr(&self, addr: IpAddr) -> Option<PeerId> {
        self.claims.read().get(&addr).cloned()
    }
}
