//! Per-attempt routing decision
//!
//! `Router::decide` is the pure part of outbound resolution: given an
//! attempt's 4-tuple it classifies, consults the registry and NAT table, and
//! names where the guest connection should go. It never performs I/O, so the
//! caller can act on the decision without holding any lock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::classifier::ReservedRanges;
use super::nat::{NatTable, Resolution};
use crate::overlay::{PeerId, PeerRegistry};
use crate::stack::AttemptId;

/// Where an attempt is routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Reserved destination: complete without forwarding
    Reject,
    /// Tunnel to the claiming peer, telling it the guest's port
    Overlay { peer: PeerId, port: u16 },
    /// Dial the (possibly translated) destination directly
    Direct { target: SocketAddr, translated: bool },
}

impl RouteDecision {
    /// The forwarding path, if the attempt is forwarded at all
    #[must_use]
    pub fn kind(&self) -> Option<RouteKind> {
        match self {
            Self::Reject => None,
            Self::Overlay { .. } => Some(RouteKind::Overlay),
            Self::Direct { .. } => Some(RouteKind::Direct),
        }
    }
}

/// Forwarding path of a non-rejected attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Overlay,
    Direct,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlay => f.write_str("overlay"),
            Self::Direct => f.write_str("direct"),
        }
    }
}

/// Routing policy: reserved ranges, NAT table and peer registry
pub struct Router {
    reserved: ReservedRanges,
    nat: Arc<NatTable>,
    registry: Arc<dyn PeerRegistry>,
}

impl Router {
    /// Create a router over shared NAT and registry state
    pub fn new(
        reserved: ReservedRanges,
        nat: Arc<NatTable>,
        registry: Arc<dyn PeerRegistry>,
    ) -> Self {
        Self {
            reserved,
            nat,
            registry,
        }
    }

    /// Decide the route for one attempt
    ///
    /// Order: reserved reject, then peer claim, then NAT translation, then
    /// direct to the original destination.
    pub fn decide(&self, id: &AttemptId) -> RouteDecision {
        let dest = id.local;

        if self.reserved.is_reserved(dest.ip()) {
            trace!(%dest, "reserved destination");
            return RouteDecision::Reject;
        }

        match self.nat.resolve(dest.ip(), self.registry.as_ref()) {
            Resolution::Peer(peer) => {
                debug!(%dest, %peer, "destination claimed by peer");
                RouteDecision::Overlay {
                    peer,
                    port: dest.port(),
                }
            }
            Resolution::Translated(ip) => {
                let target = SocketAddr::new(ip, dest.port());
                debug!(%dest, %target, "NAT translation");
                RouteDecision::Direct {
                    target,
                    translated: true,
                }
            }
            Resolution::Unmapped => RouteDecision::Direct {
                target: dest,
                translated: false,
            },
        }
    }

    /// Shared NAT table
    #[must_use]
    pub fn nat(&self) -> &Arc<NatTable> {
        &self.nat
    }

    /// Reserved ranges in effect
    #[must_use]
    pub fn reserved(&self) -> &ReservedRanges {
        &self.reserved
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("reserved", &self.reserved)
            .field("nat_entries", &self.nat.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::StaticPeerRegistry;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn attempt(local: &str) -> AttemptId {
        AttemptId {
            local: local.parse().unwrap(),
            remote: "192.168.127.2:50000".parse().unwrap(),
        }
    }

    fn router(registry: Arc<StaticPeerRegistry>, nat: NatTable) -> Router {
        Router::new(ReservedRanges::default(), Arc::new(nat), registry)
    }

    /// Registry that counts lookups
    #[derive(Default)]
    struct CountingRegistry(AtomicUsize);

    impl PeerRegistry for CountingRegistry {
        fn lookup_peer_by_addr(&self, _addr: IpAddr) -> Option<PeerId> {
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn test_reserved_rejects_without_lookup() {
        let registry = Arc::new(CountingRegistry::default());
        let router = Router::new(
            ReservedRanges::default(),
            Arc::new(NatTable::new()),
            registry.clone(),
        );

        assert_eq!(router.decide(&attempt("169.254.169.254:80")), RouteDecision::Reject);
        assert_eq!(registry.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_peer_claim_routes_to_overlay() {
        let registry = Arc::new(StaticPeerRegistry::new());
        let peer: PeerId = "node-p".parse().unwrap();
        registry.claim("10.0.0.5".parse().unwrap(), peer.clone());
        let nat = NatTable::with_entries([("10.0.0.5".parse().unwrap(), "127.0.0.1".parse().unwrap())]);

        let decision = router(registry, nat).decide(&attempt("10.0.0.5:443"));
        assert_eq!(decision, RouteDecision::Overlay { peer, port: 443 });
        assert_eq!(decision.kind(), Some(RouteKind::Overlay));
    }

    #[test]
    fn test_nat_translates_and_keeps_port() {
        let nat = NatTable::with_entries([("192.168.127.254".parse().unwrap(), "127.0.0.1".parse().unwrap())]);
        let decision = router(Arc::new(StaticPeerRegistry::new()), nat)
            .decide(&attempt("192.168.127.254:8080"));

        assert_eq!(
            decision,
            RouteDecision::Direct {
                target: "127.0.0.1:8080".parse().unwrap(),
                translated: true,
            }
        );
    }

    #[test]
    fn test_unmapped_dials_original() {
        let decision = router(Arc::new(StaticPeerRegistry::new()), NatTable::new())
            .decide(&attempt("93.184.216.34:443"));

        assert_eq!(
            decision,
            RouteDecision::Direct {
                target: "93.184.216.34:443".parse().unwrap(),
                translated: false,
            }
        );
        assert_eq!(decision.kind(), Some(RouteKind::Direct));
        assert_eq!(RouteDecision::Reject.kind(), None);
    }

    #[test]
    fn test_route_kind_display() {
        assert_eq!(RouteKind::Overlay.to_string(), "overlay");
        assert_eq!(serde_json::to_string(&RouteKind::Direct).unwrap(), "\"direct\"");
    }
}
