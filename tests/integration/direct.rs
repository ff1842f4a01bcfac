//! Direct route: fall-through, translation and bounded dials

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tapgate::connection::{handle_attempt, AttemptOutcome};
use tapgate::error::{ConnectionError, OutboundError};
use tapgate::outbound::{DirectOutbound, Outbound};
use tapgate::overlay::MemoryOverlayHub;
use tapgate::route::RouteKind;
use tapgate::stack::VirtualStack;

use super::harness::{addr, Gateway, HangingOutbound, RecordingOutbound};

#[tokio::test]
async fn test_unmapped_destination_dials_original_address() {
    let hub = MemoryOverlayHub::new();
    let recording = Arc::new(RecordingOutbound::default());
    let gateway = Gateway::join(&hub, "gw-a", recording.clone());

    // A NAT entry for another address does not apply
    gateway
        .nat
        .set("10.0.0.8".parse().unwrap(), "127.0.0.1".parse().unwrap());

    let stack = gateway.stack.clone();
    let guest = tokio::spawn(async move {
        stack
            .connect(addr("198.51.100.20:8443"), addr("192.168.127.2:42000"))
            .await
    });

    let attempt = gateway.stack.accept().await.unwrap();
    let outcome = handle_attempt(attempt, &gateway.ctx).await;

    assert_eq!(recording.targets(), vec![addr("198.51.100.20:8443")]);
    assert_eq!(outcome.route(), Some(RouteKind::Direct));
    assert!(guest.await.unwrap().is_err());
}

#[tokio::test]
async fn test_translation_keeps_original_port() {
    let hub = MemoryOverlayHub::new();
    let recording = Arc::new(RecordingOutbound::default());
    let gateway = Gateway::join(&hub, "gw-a", recording.clone());
    gateway
        .nat
        .set("10.0.0.7".parse().unwrap(), "192.0.2.7".parse().unwrap());

    let stack = gateway.stack.clone();
    let guest = tokio::spawn(async move {
        stack
            .connect(addr("10.0.0.7:5000"), addr("192.168.127.2:42001"))
            .await
    });

    let attempt = gateway.stack.accept().await.unwrap();
    handle_attempt(attempt, &gateway.ctx).await;

    assert_eq!(recording.targets(), vec![addr("192.0.2.7:5000")]);
    assert!(guest.await.unwrap().is_err());
}

#[tokio::test]
async fn test_hung_dial_is_abandoned_after_timeout() {
    let hub = MemoryOverlayHub::new();
    let hanging = Arc::new(HangingOutbound::default());
    let gateway = Gateway::join(&hub, "gw-a", hanging.clone());

    let stack = gateway.stack.clone();
    let guest = tokio::spawn(async move {
        stack
            .connect(addr("203.0.113.50:80"), addr("192.168.127.2:42002"))
            .await
    });

    let attempt = gateway.stack.accept().await.unwrap();
    let started = Instant::now();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        handle_attempt(attempt, &gateway.ctx),
    )
    .await
    .expect("attempt must not stay pending");

    assert!(started.elapsed() >= gateway.ctx.direct_dial_timeout);
    assert_eq!(hanging.dials(), 1);
    match outcome {
        AttemptOutcome::Failed { route, error } => {
            assert_eq!(route, RouteKind::Direct);
            assert!(matches!(
                error,
                ConnectionError::Outbound(OutboundError::Timeout { timeout_ms: 200, .. })
            ));
            assert!(error.is_transient());
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // The guest is told, not left hanging
    assert!(guest.await.unwrap().is_err());
}

#[tokio::test]
async fn test_direct_outbound_reaches_host_listener() {
    let host = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = host.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut conn, _) = host.accept().await.unwrap();
        conn.write_all(b"banner").await.unwrap();
    });

    let outbound = DirectOutbound::default();
    let mut conn = outbound
        .connect(target, Duration::from_secs(1))
        .await
        .unwrap();
    let mut banner = Vec::new();
    conn.read_to_end(&mut banner).await.unwrap();
    assert_eq!(banner, b"banner");
    server.await.unwrap();
}

#[tokio::test]
async fn test_direct_outbound_refused_is_transient() {
    // Bind then drop to find a port with nothing listening
    let target = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let err = DirectOutbound::default()
        .connect(target, Duration::from_secs(1))
        .await
        .err()
        .unwrap();
    assert!(err.is_transient());
}
