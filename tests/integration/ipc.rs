//! IPC round trips against a live gateway

use std::net::IpAddr;
use std::sync::Arc;

use tempfile::tempdir;

use tapgate::config::IpcConfig;
use tapgate::ipc::{IpcClient, IpcCommand, IpcHandler, IpcResponse, IpcServer};
use tapgate::overlay::MemoryOverlayHub;
use tapgate::route::RouteDecision;
use tapgate::stack::{AttemptId, Route};

use super::harness::{addr, peer, Gateway, RecordingOutbound, PROTO};

struct Running {
    gateway: Gateway,
    handler: Arc<IpcHandler>,
    server: Arc<IpcServer>,
    client: IpcClient,
    _dir: tempfile::TempDir,
}

fn start() -> Running {
    let dir = tempdir().unwrap();
    let config = IpcConfig {
        socket_path: dir.path().join("tapgate.sock"),
        socket_mode: 0o600,
        enabled: true,
        max_message_size: 64 * 1024,
    };

    let hub = MemoryOverlayHub::new();
    let gateway = Gateway::join(&hub, "gw-a", Arc::new(RecordingOutbound::default()));
    let handler = Arc::new(IpcHandler::new(
        gateway.manager(8),
        gateway.nat.clone(),
        gateway.registry.clone(),
        gateway.stack.clone(),
        gateway.id.clone(),
        PROTO,
    ));

    let client = IpcClient::new(&config.socket_path);
    let server = Arc::new(IpcServer::new(config, handler.clone()));
    let listener = server.bind().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });

    Running {
        gateway,
        handler,
        server,
        client,
        _dir: dir,
    }
}

fn decide(gateway: &Gateway, dest: &str) -> RouteDecision {
    gateway.ctx.router.decide(&AttemptId {
        local: addr(dest),
        remote: addr("192.168.127.2:40000"),
    })
}

#[tokio::test]
async fn test_nat_edits_take_effect_on_routing() {
    let running = start();
    let address: IpAddr = "192.168.127.254".parse().unwrap();

    assert_eq!(
        decide(&running.gateway, "192.168.127.254:80"),
        RouteDecision::Direct {
            target: addr("192.168.127.254:80"),
            translated: false
        }
    );

    running
        .client
        .nat_set(address, "127.0.0.1".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(
        decide(&running.gateway, "192.168.127.254:80"),
        RouteDecision::Direct {
            target: addr("127.0.0.1:80"),
            translated: true
        }
    );

    let entries = running.client.nat_list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].address, address);

    running.client.nat_delete(address).await.unwrap();
    assert!(running.gateway.nat.is_empty());

    running.server.shutdown();
}

#[tokio::test]
async fn test_peer_claims_take_effect_on_routing() {
    let running = start();
    let address: IpAddr = "10.0.0.5".parse().unwrap();

    running
        .client
        .peer_claim(address, peer("gw-b"))
        .await
        .unwrap();
    assert_eq!(
        decide(&running.gateway, "10.0.0.5:443"),
        RouteDecision::Overlay {
            peer: peer("gw-b"),
            port: 443
        }
    );

    // The local node cannot claim addresses for itself
    let response = running
        .client
        .send(IpcCommand::PeerClaim {
            address: "10.0.0.6".parse().unwrap(),
            peer_id: peer("gw-a"),
        })
        .await
        .unwrap();
    assert!(response.is_error());

    running.client.peer_release(address).await.unwrap();
    assert!(running.client.peer_release(address).await.is_err());
    assert!(running.client.peer_list().await.unwrap().is_empty());

    running.server.shutdown();
}

#[tokio::test]
async fn test_status_routes_and_shutdown() {
    let running = start();
    running.gateway.stack.set_routes(vec![Route {
        destination: "192.168.127.0/24".parse().unwrap(),
        gateway: None,
        interface: "tap0".into(),
    }]);

    let status = running.client.status().await.unwrap();
    assert_eq!(status.local_peer, peer("gw-a"));
    assert_eq!(status.protocol_id, PROTO);
    assert!(status.accepting);

    let routes = running.client.route_table().await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].interface, "tap0");

    let stats = running.client.stats().await.unwrap();
    assert_eq!(stats.accepted, 0);

    let mut requested = running.handler.subscribe_shutdown();
    running.client.shutdown().await.unwrap();
    assert!(requested.recv().await.is_ok());

    // Server keeps answering until the process acts on the request
    assert!(matches!(
        running.client.send(IpcCommand::Ping).await.unwrap(),
        IpcResponse::Pong
    ));

    running.server.shutdown();
}
