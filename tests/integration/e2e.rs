//! End-to-end routing across two gateways
//!
//! Gateway A receives the guest's attempt. Destinations claimed by gateway
//! B travel over the overlay and are dialed inside B's stack at the tap
//! address; reserved destinations go nowhere; NAT-translated destinations
//! are dialed directly from the host.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tapgate::connection::{handle_attempt, run_accept_loop, AttemptOutcome};
use tapgate::overlay::{MemoryOverlayHub, OverlayStream, OverlayTransport, PeerId, StreamHandler};
use tapgate::route::RouteKind;
use tapgate::stack::VirtualStack;

use super::harness::{addr, eventually, peer, Gateway, RecordingOutbound, PROTO};

/// Captures the first two bytes of each stream, then closes it
struct RawHeaderCapture {
    headers: mpsc::UnboundedSender<[u8; 2]>,
}

#[async_trait]
impl StreamHandler for RawHeaderCapture {
    async fn handle(&self, mut stream: OverlayStream, _remote: PeerId) {
        let mut header = [0u8; 2];
        if stream.read_exact(&mut header).await.is_ok() {
            let _ = self.headers.send(header);
        }
    }
}

#[tokio::test]
async fn test_claimed_destination_writes_port_header() {
    let hub = MemoryOverlayHub::new();
    let a = Gateway::join(&hub, "gw-a", Arc::new(RecordingOutbound::default()));
    let raw = hub.join(peer("peer-raw"));
    let (tx, mut headers) = mpsc::unbounded_channel();
    raw.register_handler(PROTO, Arc::new(RawHeaderCapture { headers: tx }));
    a.registry
        .claim("10.0.0.9".parse().unwrap(), peer("peer-raw"));

    let stack = a.stack.clone();
    let guest = tokio::spawn(async move {
        let mut conn = stack
            .connect(addr("10.0.0.9:443"), addr("192.168.127.2:40001"))
            .await
            .unwrap();
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let attempt = a.stack.accept().await.unwrap();
    let outcome = handle_attempt(attempt, &a.ctx).await;

    assert_eq!(headers.recv().await.unwrap(), [0x01, 0xBB]);
    assert_eq!(outcome.route(), Some(RouteKind::Overlay));
    assert!(outcome.is_bridged());
    assert!(guest.await.unwrap().is_empty());
    assert_eq!(a.overlay.streams_opened(), 1);
}

#[tokio::test]
async fn test_claimed_destination_bridges_through_peer() {
    let hub = MemoryOverlayHub::new();
    let recording = Arc::new(RecordingOutbound::default());
    let a = Gateway::join(&hub, "gw-a", recording.clone());
    let b = Gateway::with_direct(&hub, "gw-b");
    a.registry.claim("10.0.0.5".parse().unwrap(), b.id.clone());

    let mut service = b.stack.listen(addr("192.168.127.1:443"));
    let server = tokio::spawn(async move {
        let mut conn = service.accept().await.unwrap();
        let mut request = [0u8; 5];
        conn.read_exact(&mut request).await.unwrap();
        conn.write_all(b"200 OK").await.unwrap();
        request
    });

    let stack = a.stack.clone();
    let guest = tokio::spawn(async move {
        let mut conn = stack
            .connect(addr("10.0.0.5:443"), addr("192.168.127.2:40000"))
            .await
            .unwrap();
        conn.write_all(b"GET /").await.unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        reply
    });

    let attempt = a.stack.accept().await.unwrap();
    let outcome = handle_attempt(attempt, &a.ctx).await;

    assert_eq!(&server.await.unwrap(), b"GET /");
    assert_eq!(guest.await.unwrap(), b"200 OK");
    match outcome {
        AttemptOutcome::Bridged { route, copy } => {
            assert_eq!(route, RouteKind::Overlay);
            assert_eq!(copy.a_to_b, 5);
            assert_eq!(copy.b_to_a, 6);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // One fresh stream, one dial into B's stack, nothing dialed directly
    assert_eq!(a.overlay.streams_opened(), 1);
    assert_eq!(b.stack.dials(), 1);
    assert!(recording.targets().is_empty());
    assert!(eventually(|| b.stats.bytes_rx() + b.stats.bytes_tx() == 11).await);
    assert_eq!(b.stats.inbound_streams(), 1);
    assert_eq!(b.stats.inbound_failed(), 0);
}

#[tokio::test]
async fn test_reserved_destination_touches_nothing() {
    let hub = MemoryOverlayHub::new();
    let recording = Arc::new(RecordingOutbound::default());
    let a = Gateway::join(&hub, "gw-a", recording.clone());
    let _b = Gateway::with_direct(&hub, "gw-b");

    // Neither a claim nor a NAT entry can route a reserved address
    let metadata = "169.254.169.254".parse().unwrap();
    a.registry.claim(metadata, peer("gw-b"));
    a.nat.set(metadata, "127.0.0.1".parse().unwrap());

    let stack = a.stack.clone();
    let guest = tokio::spawn(async move {
        stack
            .connect(addr("169.254.169.254:80"), addr("192.168.127.2:40002"))
            .await
    });

    let attempt = a.stack.accept().await.unwrap();
    let outcome = handle_attempt(attempt, &a.ctx).await;

    assert!(matches!(outcome, AttemptOutcome::Rejected));
    assert!(guest.await.unwrap().is_err());
    assert_eq!(a.overlay.streams_opened(), 0);
    assert!(recording.targets().is_empty());
}

#[tokio::test]
async fn test_translated_destination_dialed_directly() {
    let hub = MemoryOverlayHub::new();
    let a = Gateway::with_direct(&hub, "gw-a");

    let host = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = host.local_addr().unwrap().port();
    a.nat
        .set("10.0.0.7".parse().unwrap(), "127.0.0.1".parse().unwrap());

    let server = tokio::spawn(async move {
        let (mut conn, _) = host.accept().await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        conn.write_all(b"yo").await.unwrap();
        buf
    });

    let stack = a.stack.clone();
    let dest = format!("10.0.0.7:{port}");
    let guest = tokio::spawn(async move {
        let mut conn = stack
            .connect(addr(&dest), addr("192.168.127.2:40003"))
            .await
            .unwrap();
        conn.write_all(b"hi").await.unwrap();
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        reply
    });

    let attempt = a.stack.accept().await.unwrap();
    let outcome = handle_attempt(attempt, &a.ctx).await;

    assert_eq!(&server.await.unwrap(), b"hi");
    assert_eq!(guest.await.unwrap(), b"yo");
    assert_eq!(outcome.route(), Some(RouteKind::Direct));
    assert!(outcome.is_bridged());
    assert_eq!(a.overlay.streams_opened(), 0);
}

#[tokio::test]
async fn test_accept_loop_routes_mixed_attempts() {
    let hub = MemoryOverlayHub::new();
    let recording = Arc::new(RecordingOutbound::default());
    let a = Gateway::join(&hub, "gw-a", recording.clone());
    let b = Gateway::with_direct(&hub, "gw-b");
    a.registry.claim("10.0.0.5".parse().unwrap(), b.id.clone());

    let manager = a.manager(16);
    let stack: Arc<dyn VirtualStack> = a.stack.clone();
    let accept_loop = tokio::spawn(run_accept_loop(stack, manager.clone()));

    let mut service = b.stack.listen(addr("192.168.127.1:22"));
    let server = tokio::spawn(async move {
        let mut conn = service.accept().await.unwrap();
        conn.write_all(b"SSH-2.0").await.unwrap();
    });

    let overlay_guest = {
        let stack = a.stack.clone();
        tokio::spawn(async move {
            let mut conn = stack
                .connect(addr("10.0.0.5:22"), addr("192.168.127.2:41000"))
                .await
                .unwrap();
            let mut banner = Vec::new();
            conn.read_to_end(&mut banner).await.unwrap();
            banner
        })
    };
    let reserved = a
        .stack
        .connect(addr("169.254.1.1:80"), addr("192.168.127.2:41001"))
        .await;
    let unreachable = a
        .stack
        .connect(addr("203.0.113.10:80"), addr("192.168.127.2:41002"))
        .await;

    assert!(reserved.is_err());
    assert!(unreachable.is_err());
    assert_eq!(recording.targets(), vec![addr("203.0.113.10:80")]);

    server.await.unwrap();
    assert_eq!(overlay_guest.await.unwrap(), b"SSH-2.0");

    let stats = manager.stats().clone();
    assert!(eventually(|| stats.active() == 0 && stats.bridged() == 1).await);
    let snapshot = manager.stats_snapshot();
    assert_eq!(snapshot.accepted, 3);
    assert_eq!(snapshot.rejected_policy, 1);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.overlay, 1);
    assert_eq!(snapshot.direct, 1);

    a.stack.close();
    accept_loop.await.unwrap().unwrap();
}
