//! Inbound overlay listener: streams opened by a remote peer

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tapgate::connection::{ConnectionStats, InboundOverlayListener};
use tapgate::overlay::{encode_port, MemoryOverlayHub, OverlayTransport, StreamHandler};
use tapgate::stack::{MemoryStack, Route};

use super::harness::{addr, eventually, peer, Gateway, PROTO};

#[tokio::test]
async fn test_peer_stream_reaches_guest_service() {
    let hub = MemoryOverlayHub::new();
    let gateway = Gateway::with_direct(&hub, "gw-a");
    let remote = hub.join(peer("peer-p"));

    let mut service = gateway.stack.listen(addr("192.168.127.1:8080"));

    let mut stream = remote.open_stream(&gateway.id, PROTO).await.unwrap();
    stream.write_all(&encode_port(8080)).await.unwrap();
    stream.write_all(b"ping").await.unwrap();

    let mut conn = service.accept().await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong").await.unwrap();
    drop(conn);

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"pong");
    drop(stream);

    assert!(eventually(|| gateway.stats.bytes_rx() + gateway.stats.bytes_tx() == 8).await);
    assert_eq!(gateway.stats.inbound_streams(), 1);
}

#[tokio::test]
async fn test_failed_streams_do_not_affect_others() {
    let hub = MemoryOverlayHub::new();
    let gateway = Gateway::with_direct(&hub, "gw-a");
    let remote = hub.join(peer("peer-p"));
    let mut service = gateway.stack.listen(addr("192.168.127.1:5432"));

    // Short header: one byte, then close
    let mut short = remote.open_stream(&gateway.id, PROTO).await.unwrap();
    short.write_all(&[0x15]).await.unwrap();
    drop(short);

    // Nothing listens on port 5433 inside the stack
    let mut refused = remote.open_stream(&gateway.id, PROTO).await.unwrap();
    refused.write_all(&encode_port(5433)).await.unwrap();

    let mut good = remote.open_stream(&gateway.id, PROTO).await.unwrap();
    good.write_all(&encode_port(5432)).await.unwrap();
    good.write_all(b"query").await.unwrap();

    let mut conn = service.accept().await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"query");

    // The refused stream is closed without any payload
    let mut rest = Vec::new();
    refused.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert!(eventually(|| gateway.stats.inbound_failed() == 2).await);
    assert_eq!(gateway.stats.inbound_streams(), 3);
    assert_eq!(gateway.stack.dials(), 2);
}

#[tokio::test]
async fn test_unparsable_tap_ip_falls_back_to_loopback() {
    let stack = MemoryStack::new();
    stack.set_routes(vec![Route {
        destination: "192.168.127.0/24".parse().unwrap(),
        gateway: None,
        interface: "tap0".into(),
    }]);
    let mut service = stack.listen(addr("127.0.0.1:9000"));
    let stats = Arc::new(ConnectionStats::new());
    let listener = InboundOverlayListener::new(
        stack.clone(),
        "tap-address",
        Duration::from_millis(200),
        stats.clone(),
    );
    assert_eq!(listener.tap_ip().to_string(), "127.0.0.1");

    let (mut peer_end, ours) = tokio::io::duplex(256);
    peer_end.write_all(&encode_port(9000)).await.unwrap();
    drop(peer_end);

    // Dropping the accepted connection lets the bridge finish
    let (_, accepted) = tokio::join!(
        listener.handle(Box::new(ours), peer("peer-p")),
        async { service.accept().await.is_some() }
    );
    assert!(accepted);
    assert_eq!(stats.inbound_failed(), 0);
}

#[tokio::test]
async fn test_unresponsive_stack_service_times_out() {
    let stack = MemoryStack::new();
    stack.blackhole(addr("192.168.127.1:7000"));
    let stats = Arc::new(ConnectionStats::new());
    let listener = InboundOverlayListener::new(
        stack.clone(),
        "192.168.127.1",
        Duration::from_millis(50),
        stats.clone(),
    );

    let (mut peer_end, ours) = tokio::io::duplex(256);
    peer_end.write_all(&encode_port(7000)).await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(2),
        listener.handle(Box::new(ours), peer("peer-p")),
    )
    .await
    .expect("stream handler must give up after the dial timeout");
    assert_eq!(stats.inbound_failed(), 1);

    // The stream was dropped, so the peer sees EOF
    let mut rest = Vec::new();
    peer_end.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}
