//! Configuration files on disk driving the routing policy

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;

use tapgate::config::{create_default_config, load_config, Config};
use tapgate::error::ConfigError;
use tapgate::overlay::StaticPeerRegistry;
use tapgate::route::{NatTable, ReservedRanges, RouteDecision, Router};
use tapgate::stack::AttemptId;

use super::harness::{addr, peer};

const GATEWAY_CONFIG: &str = r#"{
    "tap": { "listen": "127.0.0.1:17894", "tap_ip": "10.88.0.1" },
    "forwarder": {
        "protocol_id": "/gvisor/libp2p-tap-tcp/1.0.0",
        "reserved_subnets": ["169.254.0.0/16", "100.100.100.0/24"],
        "direct_dial_timeout_ms": 1500
    },
    "overlay": {
        "peer_id": "gw-a",
        "listen": "0.0.0.0:4100",
        "peers": [{ "peer_id": "gw-b", "address": "10.0.0.20:4100" }]
    },
    "nat": [{ "address": "10.88.0.254", "translated": "127.0.0.1" }],
    "claims": [{ "address": "10.88.0.50", "peer_id": "gw-b" }],
    "log": { "level": "debug", "format": "json" }
}"#;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn router_from(config: &Config) -> Router {
    Router::new(
        ReservedRanges::new(config.forwarder.reserved_subnets.clone()),
        Arc::new(NatTable::with_entries(
            config.nat.iter().map(|e| (e.address, e.translated)),
        )),
        Arc::new(StaticPeerRegistry::with_claims(
            config.claims.iter().map(|c| (c.address, c.peer_id.clone())),
        )),
    )
}

fn decide(router: &Router, dest: &str) -> RouteDecision {
    router.decide(&AttemptId {
        local: addr(dest),
        remote: addr("10.88.0.2:40000"),
    })
}

#[test]
fn test_config_file_drives_routing() {
    let file = write_config(GATEWAY_CONFIG);
    let config = load_config(file.path()).unwrap();

    assert_eq!(config.tap.tap_ip, "10.88.0.1");
    assert_eq!(
        config.forwarder.direct_dial_timeout(),
        Duration::from_millis(1500)
    );
    assert_eq!(config.forwarder.overlay_open_timeout(), Duration::from_secs(10));

    let router = router_from(&config);
    assert_eq!(decide(&router, "100.100.100.100:53"), RouteDecision::Reject);
    assert_eq!(
        decide(&router, "10.88.0.50:22"),
        RouteDecision::Overlay {
            peer: peer("gw-b"),
            port: 22
        }
    );
    assert_eq!(
        decide(&router, "10.88.0.254:80"),
        RouteDecision::Direct {
            target: addr("127.0.0.1:80"),
            translated: true
        }
    );
}

#[test]
fn test_claim_for_unknown_peer_rejected() {
    let json = GATEWAY_CONFIG.replace(
        r#""claims": [{ "address": "10.88.0.50", "peer_id": "gw-b" }]"#,
        r#""claims": [{ "address": "10.88.0.50", "peer_id": "gw-c" }]"#,
    );
    let file = write_config(&json);
    assert!(matches!(
        load_config(file.path()),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn test_generated_default_config_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    create_default_config(&path).unwrap();

    let config = load_config(&path).unwrap();
    let router = router_from(&config);
    assert_eq!(decide(&router, "169.254.169.254:80"), RouteDecision::Reject);
}
