//! Overlay transport abstractions
//!
//! The forwarder consumes three things from the peer-to-peer layer: a way to
//! open a stream to a peer for a protocol, a way to be handed streams that
//! peers open to us, and a registry answering "which peer claims this
//! address". Discovery, handshakes and authentication live below these traits.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::io::ByteStream;

/// Maximum peer id length
pub const MAX_PEER_ID_LENGTH: usize = 128;

/// A stream opened on the overlay transport
pub type OverlayStream = Box<dyn ByteStream>;

/// Identity of a node on the overlay
///
/// Alphanumeric plus `-`, `_` and `.`, 1 to 128 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Create a validated peer id
    ///
    /// # Errors
    ///
    /// Returns `OverlayError::InvalidPeerId` if the id is empty, too long or
    /// contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, OverlayError> {
        let id = id.into();
        validate_peer_id(&id)?;
        Ok(Self(id))
    }

    /// Build a peer id from a literal known to be valid
    pub(crate) fn from_static(id: &'static str) -> Self {
        debug_assert!(validate_peer_id(id).is_ok(), "invalid static peer id {id}");
        Self(id.to_owned())
    }

    /// Borrow the id as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validate a peer id string
///
/// # Errors
///
/// Returns `OverlayError::InvalidPeerId` describing the first violation.
pub fn validate_peer_id(id: &str) -> Result<(), OverlayError> {
    let invalid = |reason: &str| OverlayError::InvalidPeerId {
        peer: id.to_owned(),
        reason: reason.to_owned(),
    };

    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.len() > MAX_PEER_ID_LENGTH {
        return Err(invalid("exceeds 128 characters"));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid("only [A-Za-z0-9._-] are allowed"));
    }
    Ok(())
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = OverlayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Handler for streams peers open to this node
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Serve one accepted stream. Runs on its own task.
    async fn handle(&self, stream: OverlayStream, remote: PeerId);
}

/// Stream-oriented peer-to-peer transport
#[async_trait]
pub trait OverlayTransport: Send + Sync {
    /// This node's identity
    fn local_peer(&self) -> &PeerId;

    /// Register `handler` for streams negotiated with `protocol`
    ///
    /// A later registration for the same protocol replaces the earlier one.
    fn register_handler(&self, protocol: &str, handler: Arc<dyn StreamHandler>);

    /// Open a new stream to `peer` speaking `protocol`
    ///
    /// # Errors
    ///
    /// Returns `OverlayError` if the peer is unknown, unreachable, or does
    /// not serve `protocol`.
    async fn open_stream(&self, peer: &PeerId, protocol: &str)
        -> Result<OverlayStream, OverlayError>;
}

/// Maps virtual-stack addresses to the peer claiming them
pub trait PeerRegistry: Send + Sync {
    /// The peer claiming `addr`, if any
    fn lookup_peer_by_addr(&self, addr: IpAddr) -> Option<PeerId>;
}

impl<T: PeerRegistry + ?Sized> PeerRegistry for Arc<T> {
    fn lookup_peer_by_addr(&self, addr: IpAddr) -> Option<PeerId> {
        (**self).lookup_peer_by_addr(addr)
    }
}
