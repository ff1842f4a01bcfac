//! IPC command handler
//!
//! This module processes IPC commands and generates responses.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::protocol::{ErrorCode, IpcCommand, IpcResponse, NatEntry, PeerClaim, ServerStatus};
use crate::connection::ConnectionManager;
use crate::overlay::{PeerId, StaticPeerRegistry};
use crate::route::NatTable;
use crate::stack::VirtualStack;

/// IPC command handler
pub struct IpcHandler {
    /// Connection manager
    connection_manager: Arc<ConnectionManager>,

    /// NAT table shared with the router
    nat: Arc<NatTable>,

    /// Peer claims shared with the router
    registry: Arc<StaticPeerRegistry>,

    /// Virtual stack, for the routing table
    stack: Arc<dyn VirtualStack>,

    /// Local overlay identity
    local_peer: PeerId,

    /// Overlay protocol id
    protocol_id: String,

    /// Server start time
    start_time: Instant,

    /// Server version
    version: String,

    /// Raised by the `shutdown` command
    shutdown_tx: broadcast::Sender<()>,
}

impl IpcHandler {
    /// Create a new IPC handler
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        nat: Arc<NatTable>,
        registry: Arc<StaticPeerRegistry>,
        stack: Arc<dyn VirtualStack>,
        local_peer: PeerId,
        protocol_id: impl Into<String>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            connection_manager,
            nat,
            registry,
            stack,
            local_peer,
            protocol_id: protocol_id.into(),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown_tx,
        }
    }

    /// Receiver notified when a client requests shutdown
    #[must_use]
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Handle an IPC command and return a response
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        debug!("Handling IPC command: {:?}", command);

        match command {
            IpcCommand::Ping => IpcResponse::Pong,

            IpcCommand::Status => self.handle_status(),

            IpcCommand::GetStats => IpcResponse::Stats(self.connection_manager.stats_snapshot()),

            IpcCommand::NatSet {
                address,
                translated,
            } => {
                let previous = self.nat.set(address, translated);
                info!(
                    "NAT entry {} -> {} set (previous: {:?})",
                    address, translated, previous
                );
                IpcResponse::success()
            }

            IpcCommand::NatDelete { address } => match self.nat.delete(address) {
                Some(translated) => {
                    info!("NAT entry {} -> {} deleted", address, translated);
                    IpcResponse::success()
                }
                None => IpcResponse::error(
                    ErrorCode::NotFound,
                    format!("No NAT entry for {address}"),
                ),
            },

            IpcCommand::NatList => IpcResponse::NatList {
                entries: self
                    .nat
                    .entries()
                    .into_iter()
                    .map(|(address, translated)| NatEntry {
                        address,
                        translated,
                    })
                    .collect(),
            },

            IpcCommand::PeerClaim { address, peer_id } => self.handle_peer_claim(address, peer_id),

            IpcCommand::PeerRelease { address } => match self.registry.release(address) {
                Some(peer) => {
                    info!("Peer {} released {}", peer, address);
                    IpcResponse::success()
                }
                None => IpcResponse::error(
                    ErrorCode::NotFound,
                    format!("No peer claim for {address}"),
                ),
            },

            IpcCommand::PeerList => IpcResponse::PeerList {
                claims: self
                    .registry
                    .claims()
                    .into_iter()
                    .map(|(address, peer_id)| PeerClaim { address, peer_id })
                    .collect(),
            },

            IpcCommand::RouteTable => IpcResponse::RouteTable {
                routes: self.stack.route_table(),
            },

            IpcCommand::Shutdown => self.handle_shutdown(),
        }
    }

    fn handle_status(&self) -> IpcResponse {
        let stats = self.connection_manager.stats_snapshot();
        let shutting_down = self.connection_manager.is_shutting_down();

        IpcResponse::Status(ServerStatus {
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            local_peer: self.local_peer.clone(),
            protocol_id: self.protocol_id.clone(),
            active_connections: stats.active,
            total_connections: stats.accepted,
            nat_entries: self.nat.len(),
            peer_claims: self.registry.len(),
            accepting: !shutting_down,
            shutting_down,
        })
    }

    fn handle_peer_claim(&self, address: std::net::IpAddr, peer_id: PeerId) -> IpcResponse {
        if peer_id == self.local_peer {
            return IpcResponse::error(
                ErrorCode::InvalidParameters,
                format!("{address} cannot be claimed by the local peer"),
            );
        }

        match self.registry.claim(address, peer_id.clone()) {
            Some(previous) if previous != peer_id => {
                info!("Peer {} took over {} from {}", peer_id, address, previous);
            }
            Some(_) => {}
            None => info!("Peer {} claimed {}", peer_id, address),
        }
        IpcResponse::success()
    }

    fn handle_shutdown(&self) -> IpcResponse {
        if self.connection_manager.is_shutting_down() {
            return IpcResponse::error(ErrorCode::ShuttingDown, "Shutdown already in progress");
        }

        info!("Shutdown requested over IPC");
        // Nobody listening just means the process is already on its way out
        let _ = self.shutdown_tx.send(());
        IpcResponse::success_with_message("Shutdown initiated")
    }
}

impl std::fmt::Debug for IpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandler")
            .field("local_peer", &self.local_peer)
            .field("protocol_id", &self.protocol_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
