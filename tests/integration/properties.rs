//! Property tests for the port header, NAT table and reserved ranges

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use tapgate::error::OverlayError;
use tapgate::overlay::{
    decode_port, encode_port, read_port_header, write_port_header, PeerId, PeerRegistry,
    StaticPeerRegistry,
};
use tapgate::route::{is_reserved, NatTable, ReservedRanges, RouteDecision, Router};
use tapgate::stack::AttemptId;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn guest() -> SocketAddr {
    "192.168.127.2:40000".parse().unwrap()
}

/// Ordinary unicast IPv4 outside the reserved range
fn routable_v4() -> impl Strategy<Value = Ipv4Addr> {
    (1u8..=223, any::<u8>(), any::<u8>(), 1u8..=254)
        .prop_filter("not link-local", |(a, b, _, _)| !(*a == 169 && *b == 254))
        .prop_map(|(a, b, c, d)| Ipv4Addr::new(a, b, c, d))
}

/// Registry that counts lookups and never finds a claim
#[derive(Default)]
struct CountingRegistry {
    lookups: AtomicUsize,
}

impl PeerRegistry for CountingRegistry {
    fn lookup_peer_by_addr(&self, _addr: IpAddr) -> Option<PeerId> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        None
    }
}

proptest! {
    #[test]
    fn prop_port_header_roundtrip(port in any::<u16>()) {
        prop_assert_eq!(decode_port(encode_port(port)), port);

        let decoded = runtime().block_on(async {
            let mut wire = Vec::new();
            write_port_header(&mut wire, port).await.unwrap();
            assert_eq!(wire.len(), 2);
            read_port_header(&mut wire.as_slice()).await
        });
        prop_assert_eq!(decoded.unwrap(), port);
    }

    #[test]
    fn prop_short_header_rejected(bytes in proptest::collection::vec(any::<u8>(), 0..2)) {
        let result = runtime().block_on(read_port_header(&mut bytes.as_slice()));
        let is_short = matches!(
            result,
            Err(OverlayError::ShortHeader { received }) if received == bytes.len()
        );
        prop_assert!(is_short);
    }

    #[test]
    fn prop_reserved_never_consults_nat_or_registry(c in any::<u8>(), d in any::<u8>(), port in any::<u16>()) {
        let dest = IpAddr::V4(Ipv4Addr::new(169, 254, c, d));
        prop_assert!(is_reserved(dest));

        let registry = Arc::new(CountingRegistry::default());
        let nat = Arc::new(NatTable::new());
        nat.set(dest, "127.0.0.1".parse().unwrap());
        let router = Router::new(ReservedRanges::link_local(), nat, registry.clone());

        let decision = router.decide(&AttemptId { local: SocketAddr::new(dest, port), remote: guest() });
        prop_assert_eq!(decision, RouteDecision::Reject);
        prop_assert_eq!(registry.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn prop_committed_translation_is_dial_target(
        entries in proptest::collection::hash_map(routable_v4(), routable_v4(), 1..16),
        port in 1u16..,
    ) {
        let nat = Arc::new(NatTable::with_entries(
            entries.iter().map(|(a, t)| (IpAddr::V4(*a), IpAddr::V4(*t))),
        ));
        let router = Router::new(
            ReservedRanges::link_local(),
            nat,
            Arc::new(StaticPeerRegistry::new()),
        );

        for (address, translated) in &entries {
            let id = AttemptId { local: SocketAddr::new(IpAddr::V4(*address), port), remote: guest() };
            prop_assert_eq!(
                router.decide(&id),
                RouteDecision::Direct {
                    target: SocketAddr::new(IpAddr::V4(*translated), port),
                    translated: true,
                }
            );
        }
    }

    #[test]
    fn prop_unmapped_falls_through_untranslated(dest in routable_v4(), port in any::<u16>()) {
        let router = Router::new(
            ReservedRanges::link_local(),
            Arc::new(NatTable::new()),
            Arc::new(StaticPeerRegistry::new()),
        );
        let local = SocketAddr::new(IpAddr::V4(dest), port);
        prop_assert_eq!(
            router.decide(&AttemptId { local, remote: guest() }),
            RouteDecision::Direct { target: local, translated: false }
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Writers move a pair of entries together; readers must never see them disagree
    #[test]
    fn prop_concurrent_nat_updates_are_atomic(generations in proptest::collection::vec(1u8..=254, 1..32)) {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let nat = Arc::new(NatTable::new());
        nat.transaction(|entries| {
            entries.set(a, "172.16.0.0".parse().unwrap());
            entries.set(b, "172.16.0.0".parse().unwrap());
        });

        let writers: Vec<_> = generations
            .chunks(4)
            .map(|chunk| {
                let nat = Arc::clone(&nat);
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for g in chunk {
                        let translated = IpAddr::V4(Ipv4Addr::new(172, 16, 0, g));
                        nat.transaction(|entries| {
                            entries.set(a, translated);
                            entries.set(b, translated);
                        });
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let nat = Arc::clone(&nat);
                thread::spawn(move || {
                    let mut torn = 0usize;
                    for _ in 0..200 {
                        let snapshot: HashMap<IpAddr, IpAddr> = nat.entries().into_iter().collect();
                        if snapshot.get(&a) != snapshot.get(&b) {
                            torn += 1;
                        }
                        if nat.lookup(a).is_none() {
                            torn += 1;
                        }
                    }
                    torn
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        for reader in readers {
            prop_assert_eq!(reader.join().unwrap(), 0);
        }

        prop_assert_eq!(nat.len(), 2);
        prop_assert_eq!(nat.lookup(a), nat.lookup(b));
    }
}
