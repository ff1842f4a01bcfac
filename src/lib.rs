//! tapgate: TCP connection forwarder for a virtual-network gateway
//!
//! Guest TCP connection attempts arriving on a virtual network stack are
//! routed to one of three places:
//!
//! - **Reject**: reserved destinations (169.254.0.0/16) are never forwarded
//! - **Overlay**: destinations claimed by a remote peer are tunnelled over a
//!   fresh overlay stream, prefixed with a 2-byte destination port
//! - **Direct**: everything else is dialed from the host, after NAT
//!   translation when the table has an entry
//!
//! Streams opened by remote peers are served in the other direction: the
//! port header is read and the gateway's tap-facing address is dialed inside
//! the virtual stack.
//!
//! # Architecture
//!
//! ```text
//! guest → VirtualStack → Router::decide ─┬─ reject
//!                                        ├─ OverlayTransport → peer → [port][bytes]
//!                                        └─ DirectOutbound   → host TCP
//!
//! peer → [port][bytes] → InboundOverlayListener → VirtualStack::dial(tap_ip:port)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tapgate::config::load_config;
//! use tapgate::overlay::StaticPeerRegistry;
//! use tapgate::route::{NatTable, ReservedRanges, Router};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tapgate/config.json")?;
//!
//! let nat = Arc::new(NatTable::with_entries(
//!     config.nat.iter().map(|e| (e.address, e.translated)),
//! ));
//! let registry = Arc::new(StaticPeerRegistry::new());
//! let router = Router::new(
//!     ReservedRanges::new(config.forwarder.reserved_subnets.clone()),
//!     nat,
//!     registry,
//! );
//! # let _ = router;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Attempt handling, inbound listener, manager and statistics
//! - [`error`]: Error types
//! - [`io`]: Duplex connections and the bridge
//! - [`ipc`]: IPC server, client and protocol
//! - [`outbound`]: Direct and overlay legs
//! - [`overlay`]: Overlay transport traits, port header and transports
//! - [`route`]: Reserved ranges, NAT table and the routing decision
//! - [`stack`]: Virtual stack traits and the in-memory stack
//! - [`tproxy`]: Kernel-backed stack using TPROXY

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod error;
pub mod io;
pub mod ipc;
pub mod outbound;
pub mod overlay;
pub mod route;
pub mod stack;
pub mod tproxy;

// Re-export commonly used types at the crate root
pub use config::{Config, ForwarderConfig, TapConfig};
pub use connection::{
    handle_attempt, AttemptContext, AttemptOutcome, ConnectionManager, ConnectionStats,
    InboundOverlayListener,
};
pub use error::{
    ConfigError, ConnectionError, IpcError, OutboundError, OverlayError, StackError,
    TapgateError, TproxyError,
};
pub use ipc::{IpcClient, IpcCommand, IpcResponse, IpcServer};
pub use outbound::{DirectOutbound, Outbound, OverlayOutbound};
pub use overlay::{OverlayTransport, PeerId, PeerRegistry, StaticPeerRegistry, StreamHandler};
pub use route::{NatTable, ReservedRanges, RouteDecision, Router};
pub use stack::{AttemptId, ConnectAttempt, VirtualStack};
pub use tproxy::{TproxyListener, TproxyStack};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with required capabilities for TPROXY
///
/// # Errors
///
/// Returns `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`.
pub fn check_capabilities() -> Result<(), TproxyError> {
    if !tproxy::has_net_admin_capability() {
        return Err(TproxyError::PermissionDenied);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_check_capabilities() {
        // Result depends on the privileges of the test runner
        match check_capabilities() {
            Ok(()) | Err(TproxyError::PermissionDenied) => {}
            Err(e) => panic!("Unexpected error: {e}"),
        }
    }
}
