//! In-process virtual stack
//!
//! A guest is simulated by calling `connect` (a guest opening a connection,
//! delivered to the forwarder through `accept`) and `listen` (a guest service
//! the forwarder can `dial` into). Endpoints are tokio duplex pipes wrapped
//! with their 4-tuple addresses.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::traits::{AttemptId, ConnectAttempt, Route, VirtualStack};
use crate::error::StackError;
use crate::io::{BoxedConn, StreamConn};

/// Pipe capacity of each in-memory connection
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// First ephemeral port handed to stack-originated connections
const EPHEMERAL_PORT_BASE: u16 = 49152;

/// Queue depth of pending guest attempts
const ACCEPT_QUEUE: usize = 1024;

/// Connection as seen from the guest side
pub type GuestConn = StreamConn<DuplexStream>;

/// Failure injected into `create_endpoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointFault {
    /// Guest reset before the endpoint was created
    Refused,
    /// Stack could not allocate the endpoint
    Unavailable,
}

type CompletionSender = oneshot::Sender<Result<GuestConn, StackError>>;

/// In-memory `VirtualStack`
pub struct MemoryStack {
    attempts_tx: Mutex<Option<mpsc::Sender<MemoryAttempt>>>,
    attempts_rx: tokio::sync::Mutex<mpsc::Receiver<MemoryAttempt>>,
    listeners: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<GuestConn>>>,
    blackholes: Mutex<HashSet<SocketAddr>>,
    routes: Mutex<Vec<Route>>,
    endpoint_fault: Mutex<Option<EndpointFault>>,
    next_port: AtomicU16,
    dials: AtomicU64,
    route_reads: AtomicU64,
}

impl MemoryStack {
    /// Create an empty stack
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        Arc::new(Self {
            attempts_tx: Mutex::new(Some(tx)),
            attempts_rx: tokio::sync::Mutex::new(rx),
            listeners: Mutex::new(HashMap::new()),
            blackholes: Mutex::new(HashSet::new()),
            routes: Mutex::new(Vec::new()),
            endpoint_fault: Mutex::new(None),
            next_port: AtomicU16::new(EPHEMERAL_PORT_BASE),
            dials: AtomicU64::new(0),
            route_reads: AtomicU64::new(0),
        })
    }

    /// Simulate a guest at `remote` connecting to `local`
    ///
    /// Resolves once the forwarder completes the attempt: to the guest's end
    /// of the connection, or `ConnectionRefused` if it was rejected.
    ///
    /// # Errors
    ///
    /// Returns `StackError::Closed` if the stack is closed and
    /// `StackError::ConnectionRefused` if the attempt was rejected.
    pub async fn connect(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<GuestConn, StackError> {
        let tx = self.attempts_tx.lock().clone().ok_or(StackError::Closed)?;
        let (done_tx, done_rx) = oneshot::channel();
        let attempt = MemoryAttempt {
            id: AttemptId { local, remote },
            fault: *self.endpoint_fault.lock(),
            guest_end: None,
            done: Some(done_tx),
        };
        tx.send(attempt).await.map_err(|_| StackError::Closed)?;
        // Only the stack's own sender may keep the queue open
        drop(tx);

        done_rx
            .await
            .unwrap_or(Err(StackError::ConnectionRefused { addr: local }))
    }

    /// Register a guest service at `addr`
    ///
    /// A later `listen` on the same address replaces the earlier one.
    pub fn listen(&self, addr: SocketAddr) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(addr, tx);
        MemoryListener { addr, rx }
    }

    /// Make dials to `addr` hang forever
    pub fn blackhole(&self, addr: SocketAddr) {
        self.blackholes.lock().insert(addr);
    }

    /// Fail `create_endpoint` for attempts created from now on
    pub fn set_endpoint_fault(&self, fault: Option<EndpointFault>) {
        *self.endpoint_fault.lock() = fault;
    }

    /// Replace the reported routing table
    pub fn set_routes(&self, routes: Vec<Route>) {
        *self.routes.lock() = routes;
    }

    /// Number of `dial` calls made into the stack
    #[must_use]
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Number of `route_table` calls made into the stack
    #[must_use]
    pub fn route_reads(&self) -> u64 {
        self.route_reads.load(Ordering::Relaxed)
    }

    /// Stop delivering attempts; pending and future `accept` calls fail
    pub fn close(&self) {
        self.attempts_tx.lock().take();
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let port = if port < EPHEMERAL_PORT_BASE {
            EPHEMERAL_PORT_BASE
        } else {
            port
        };
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
    }
}

impl std::fmt::Debug for MemoryStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStack")
            .field("listeners", &self.listeners.lock().len())
            .field("dials", &self.dials())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl VirtualStack for MemoryStack {
    async fn accept(&self) -> Result<Box<dyn ConnectAttempt>, StackError> {
        let mut rx = self.attempts_rx.lock().await;
        match rx.recv().await {
            Some(attempt) => Ok(Box::new(attempt)),
            None => Err(StackError::Closed),
        }
    }

    async fn dial(&self, addr: SocketAddr) -> Result<BoxedConn, StackError> {
        self.dials.fetch_add(1, Ordering::Relaxed);

        let blackholed = self.blackholes.lock().contains(&addr);
        if blackholed {
            trace!(%addr, "dial into blackhole");
            std::future::pending::<()>().await;
        }

        let listener = self.listeners.lock().get(&addr).cloned();
        let Some(listener) = listener else {
            return Err(StackError::ConnectionRefused { addr });
        };

        let local = self.ephemeral_addr();
        let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        listener
            .send(StreamConn::new(theirs, addr, local))
            .map_err(|_| StackError::ConnectionRefused { addr })?;

        trace!(%addr, %local, "dialed into memory stack");
        Ok(Box::new(StreamConn::new(ours, local, addr)))
    }

    fn route_table(&self) -> Vec<Route> {
        self.route_reads.fetch_add(1, Ordering::Relaxed);
        self.routes.lock().clone()
    }
}

/// A guest service registered with `MemoryStack::listen`
#[derive(Debug)]
pub struct MemoryListener {
    addr: SocketAddr,
    rx: mpsc::UnboundedReceiver<GuestConn>,
}

impl MemoryListener {
    /// Wait for the next connection dialed into this service
    pub async fn accept(&mut self) -> Option<GuestConn> {
        self.rx.recv().await
    }

    /// Address this service listens on
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// A guest attempt queued on a `MemoryStack`
struct MemoryAttempt {
    id: AttemptId,
    fault: Option<EndpointFault>,
    guest_end: Option<GuestConn>,
    done: Option<CompletionSender>,
}

#[async_trait]
impl ConnectAttempt for MemoryAttempt {
    fn id(&self) -> AttemptId {
        self.id
    }

    async fn create_endpoint(&mut self) -> Result<BoxedConn, StackError> {
        match self.fault {
            Some(EndpointFault::Refused) => {
                return Err(StackError::ConnectionRefused { addr: self.id.local })
            }
            Some(EndpointFault::Unavailable) => {
                return Err(StackError::EndpointUnavailable("injected fault".into()))
            }
            None => {}
        }

        let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        self.guest_end = Some(StreamConn::new(theirs, self.id.remote, self.id.local));
        Ok(Box::new(StreamConn::new(ours, self.id.local, self.id.remote)))
    }

    fn complete(&mut self, reject: bool) {
        let Some(done) = self.done.take() else {
            return;
        };
        let result = match (reject, self.guest_end.take()) {
            (false, Some(guest)) => Ok(guest),
            _ => Err(StackError::ConnectionRefused {
                addr: self.id.local,
            }),
        };
        let _ = done.send(result);
    }
}

impl Drop for MemoryAttempt {
    fn drop(&mut self) {
        self.complete(true);
    }
}
