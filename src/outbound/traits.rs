//! Outbound trait definitions
//!
//! The forwarder reaches destinations outside the virtual network through an
//! `Outbound`. The host kernel dialer is the only production implementation;
//! tests plug in their own.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::OutboundError;
use crate::io::BoxedConn;

/// A way of dialing destinations outside the virtual network
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Short name used in logs
    fn tag(&self) -> &str;

    /// Connect to `addr`, giving up after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// `OutboundError::Refused` and `OutboundError::Timeout` are the expected
    /// failures on a live network; anything else is unexpected.
    async fn connect(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<BoxedConn, OutboundError>;
}
