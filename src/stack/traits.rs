//! Virtual network stack abstractions
//!
//! The stack terminates guest TCP and reports each new guest connection as a
//! `ConnectAttempt`. The forwarder decides what to do with it, then either
//! creates the guest-facing endpoint and completes the attempt, or completes
//! it with reject so the guest sees a reset.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::StackError;
use crate::io::BoxedConn;

/// 4-tuple identifying a guest connection attempt
///
/// `local` is the destination the guest asked for; `remote` is the guest's
/// own source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    /// Destination address and port requested by the guest
    pub local: SocketAddr,
    /// Guest source address and port
    pub remote: SocketAddr,
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// One entry of the stack's routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination subnet
    pub destination: IpNet,
    /// Next hop, if not directly connected
    pub gateway: Option<IpAddr>,
    /// Outgoing interface
    pub interface: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(f, "{} via {} dev {}", self.destination, gw, self.interface),
            None => write!(f, "{} dev {}", self.destination, self.interface),
        }
    }
}

/// A pending guest connection
///
/// Exactly one `complete` call takes effect; later calls are ignored. An
/// attempt dropped without being completed is rejected.
#[async_trait]
pub trait ConnectAttempt: Send {
    /// The attempt's 4-tuple
    fn id(&self) -> AttemptId;

    /// Create the guest-facing endpoint of this connection
    ///
    /// # Errors
    ///
    /// Returns `StackError::ConnectionRefused` if the guest already reset the
    /// connection, or another `StackError` if the stack cannot create it.
    async fn create_endpoint(&mut self) -> Result<BoxedConn, StackError>;

    /// Acknowledge the attempt; `reject` resets the guest connection
    fn complete(&mut self, reject: bool);
}

/// A user-space (or kernel-backed) network stack facing the guest
#[async_trait]
pub trait VirtualStack: Send + Sync {
    /// Wait for the next guest connection attempt
    ///
    /// # Errors
    ///
    /// Returns `StackError::Closed` once the stack is shut down; other errors
    /// concern a single attempt and the caller may keep accepting.
    async fn accept(&self) -> Result<Box<dyn ConnectAttempt>, StackError>;

    /// Open a connection into the guest network
    ///
    /// # Errors
    ///
    /// Returns `StackError::ConnectionRefused` if nothing listens at `addr`.
    async fn dial(&self, addr: SocketAddr) -> Result<BoxedConn, StackError>;

    /// The stack's routing table, for diagnostics
    fn route_table(&self) -> Vec<Route>;
}
