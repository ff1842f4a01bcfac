//! Static-peer overlay transport over TCP
//!
//! Every known peer maps to a TCP endpoint. Opening a stream dials the peer
//! and runs a one-shot negotiation before handing the socket to the caller:
//!
//! ```text
//! opener  -> [len u8][protocol id][len u8][opener peer id]
//! acceptor -> [ack u8]   0x00 = accepted, 0x01 = protocol not served
//! ```
//!
//! After the ack the socket is a raw ordered byte stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::traits::{OverlayStream, OverlayTransport, PeerId, StreamHandler};
use crate::error::OverlayError;

/// Negotiation accepted
pub const ACK_ACCEPTED: u8 = 0x00;

/// Negotiation refused: no handler for the protocol
pub const ACK_UNSUPPORTED: u8 = 0x01;

type HandlerMap = HashMap<String, Arc<dyn StreamHandler>>;

/// Overlay transport reaching a fixed set of peers over TCP
pub struct TcpOverlay {
    local: PeerId,
    peers: RwLock<HashMap<PeerId, SocketAddr>>,
    handlers: Arc<RwLock<HandlerMap>>,
    connect_timeout: Duration,
}

impl TcpOverlay {
    /// Create a transport for `local` with the given peer address book
    pub fn new(
        local: PeerId,
        peers: impl IntoIterator<Item = (PeerId, SocketAddr)>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            local,
            peers: RwLock::new(peers.into_iter().collect()),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            connect_timeout,
        }
    }

    /// Add or replace the address of `peer`
    pub fn add_peer(&self, peer: PeerId, addr: SocketAddr) -> Option<SocketAddr> {
        self.peers.write().insert(peer, addr)
    }

    /// Forget `peer`
    pub fn remove_peer(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.peers.write().remove(peer)
    }

    /// Address of `peer`, if known
    #[must_use]
    pub fn peer_addr(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.peers.read().get(peer).copied()
    }

    /// Bind the listener peers connect to
    ///
    /// # Errors
    ///
    /// Returns `OverlayError::IoError` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, OverlayError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Overlay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept streams from peers until shutdown
    ///
    /// Each accepted socket is negotiated and dispatched on its own task, so a
    /// slow or broken peer never stalls the listener.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handlers = Arc::clone(&self.handlers);
                            let timeout = self.connect_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = accept_stream(stream, addr, handlers, timeout).await {
                                    debug!("Overlay stream from {} rejected: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Overlay accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Overlay listener shutting down");
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for TcpOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpOverlay")
            .field("local", &self.local)
            .field("peers", &self.peers.read().len())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl OverlayTransport for TcpOverlay {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn register_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.handlers.write().insert(protocol.to_owned(), handler);
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<OverlayStream, OverlayError> {
        let addr = self
            .peer_addr(peer)
            .ok_or_else(|| OverlayError::UnknownPeer {
                peer: peer.to_string(),
            })?;

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| OverlayError::Timeout {
                peer: peer.to_string(),
                timeout_ms: timeout_ms(self.connect_timeout),
            })?
            .map_err(|e| OverlayError::unreachable(peer.as_str(), e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let mut hello = Vec::with_capacity(2 + protocol.len() + self.local.as_str().len());
        push_prefixed(&mut hello, protocol.as_bytes())?;
        push_prefixed(&mut hello, self.local.as_str().as_bytes())?;
        stream.write_all(&hello).await?;

        match stream.read_u8().await? {
            ACK_ACCEPTED => {
                trace!(%peer, %addr, protocol, "overlay stream negotiated");
                Ok(Box::new(stream))
            }
            ACK_UNSUPPORTED => Err(OverlayError::ProtocolNotSupported {
                protocol: protocol.to_owned(),
            }),
            other => Err(OverlayError::negotiation(format!(
                "unexpected ack byte 0x{other:02x}"
            ))),
        }
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn push_prefixed(buf: &mut Vec<u8>, field: &[u8]) -> Result<(), OverlayError> {
    let len = u8::try_from(field.len())
        .map_err(|_| OverlayError::negotiation("field exceeds 255 bytes"))?;
    buf.push(len);
    buf.extend_from_slice(field);
    Ok(())
}

async fn read_prefixed<R>(reader: &mut R) -> Result<String, OverlayError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await? as usize;
    let mut field = vec![0u8; len];
    reader.read_exact(&mut field).await?;
    String::from_utf8(field).map_err(|_| OverlayError::negotiation("field is not UTF-8"))
}

/// Run the acceptor side of the negotiation and dispatch to a handler
async fn accept_stream(
    mut stream: TcpStream,
    addr: SocketAddr,
    handlers: Arc<RwLock<HandlerMap>>,
    timeout: Duration,
) -> Result<(), OverlayError> {
    let (protocol, remote) = tokio::time::timeout(timeout, async {
        let protocol = read_prefixed(&mut stream).await?;
        let remote: PeerId = read_prefixed(&mut stream).await?.parse()?;
        Ok::<_, OverlayError>((protocol, remote))
    })
    .await
    .map_err(|_| OverlayError::negotiation(format!("no hello from {addr} within {timeout:?}")))??;

    let handler = handlers.read().get(&protocol).cloned();
    let Some(handler) = handler else {
        stream.write_u8(ACK_UNSUPPORTED).await?;
        return Err(OverlayError::ProtocolNotSupported { protocol });
    };

    stream.write_u8(ACK_ACCEPTED).await?;
    let _ = stream.set_nodelay(true);
    debug!(%remote, %addr, %protocol, "overlay stream accepted");
    handler.handle(Box::new(stream), remote).await;
    Ok(())
}
