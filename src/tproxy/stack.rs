//! Kernel-backed virtual stack
//!
//! Guest traffic leaving the tap interface is redirected with iptables TPROXY
//! onto `TproxyListener`. Each accepted socket is one connection attempt: the
//! kernel has already completed the guest's handshake, so creating the
//! endpoint hands the socket over, and rejecting resets it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::connection::TproxyConnection;
use super::listener::TproxyListener;
use super::socket::set_reset_on_close;
use crate::error::{StackError, TproxyError};
use crate::io::BoxedConn;
use crate::stack::{AttemptId, ConnectAttempt, Route, VirtualStack};

/// Kernel IPv4 routing table
const PROC_NET_ROUTE: &str = "/proc/net/route";

/// `RTF_GATEWAY` route flag
const RTF_GATEWAY: u32 = 0x0002;

/// `VirtualStack` backed by a TPROXY listener and kernel sockets
#[derive(Debug)]
pub struct TproxyStack {
    listener: TproxyListener,
    route_source: PathBuf,
}

impl TproxyStack {
    /// Create a stack accepting from `listener`
    #[must_use]
    pub fn new(listener: TproxyListener) -> Self {
        Self {
            listener,
            route_source: PathBuf::from(PROC_NET_ROUTE),
        }
    }

    /// Read the routing table from another file (same format as `/proc/net/route`)
    #[must_use]
    pub fn with_route_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.route_source = path.into();
        self
    }

    /// Address the TPROXY listener is bound to
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        self.listener.listen_addr()
    }
}

#[async_trait]
impl VirtualStack for TproxyStack {
    async fn accept(&self) -> Result<Box<dyn ConnectAttempt>, StackError> {
        match self.listener.accept().await {
            Ok(conn) => Ok(Box::new(TproxyAttempt::new(conn))),
            Err(TproxyError::AcceptError(e)) => Err(StackError::AcceptError(e)),
            Err(e) => Err(StackError::AcceptError(e.to_string())),
        }
    }

    async fn dial(&self, addr: SocketAddr) -> Result<BoxedConn, StackError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| StackError::from_connect(addr, e))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn route_table(&self) -> Vec<Route> {
        match std::fs::read_to_string(&self.route_source) {
            Ok(contents) => parse_proc_net_route(&contents),
            Err(e) => {
                warn!("Failed to read {:?}: {}", self.route_source, e);
                Vec::new()
            }
        }
    }
}

/// An accepted guest socket awaiting a routing decision
#[derive(Debug)]
pub struct TproxyAttempt {
    id: AttemptId,
    conn: Option<TproxyConnection>,
    completed: bool,
}

impl TproxyAttempt {
    /// Wrap an accepted connection
    #[must_use]
    pub fn new(conn: TproxyConnection) -> Self {
        Self {
            id: conn.attempt_id(),
            conn: Some(conn),
            completed: false,
        }
    }

    fn reset(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = set_reset_on_close(conn.stream()) {
                debug!("Failed to arm reset for {}: {}", self.id, e);
            }
            trace!(attempt = %self.id, "guest connection reset");
        }
    }
}

#[async_trait]
impl ConnectAttempt for TproxyAttempt {
    fn id(&self) -> AttemptId {
        self.id
    }

    async fn create_endpoint(&mut self) -> Result<BoxedConn, StackError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| StackError::EndpointUnavailable("endpoint already created".into()))?;

        // A guest that gave up while we dialed shows up as a dead peer
        let stream = conn.into_stream();
        if let Err(e) = stream.peer_addr() {
            return Err(match e.kind() {
                io::ErrorKind::NotConnected | io::ErrorKind::ConnectionReset => {
                    StackError::ConnectionRefused { addr: self.id.local }
                }
                _ => StackError::from_connect(self.id.local, e),
            });
        }
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn complete(&mut self, reject: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        if reject {
            self.reset();
        } else {
            // Not handed out: close normally
            self.conn.take();
        }
    }
}

impl Drop for TproxyAttempt {
    fn drop(&mut self) {
        if !self.completed {
            self.reset();
        }
    }
}

/// Parse the kernel's `/proc/net/route` table
///
/// Addresses are little-endian hex; unparsable lines are skipped.
#[must_use]
pub fn parse_proc_net_route(contents: &str) -> Vec<Route> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let interface = fields[0].to_string();
            let destination = parse_hex_ipv4(fields[1])?;
            let gateway = parse_hex_ipv4(fields[2])?;
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            let mask = parse_hex_ipv4(fields[7])?;

            let prefix = u32::from(mask).leading_ones() as u8;
            let net = Ipv4Net::new(destination, prefix).ok()?;
            let gateway = (flags & RTF_GATEWAY != 0).then_some(IpAddr::V4(gateway));

            Some(Route {
                destination: IpNet::V4(net),
                gateway,
                interface,
            })
        })
        .collect()
}

fn parse_hex_ipv4(field: &str) -> Option<Ipv4Addr> {
    u32::from_str_radix(field, 16)
        .ok()
        .map(|raw| Ipv4Addr::from(raw.swap_bytes()))
}
