//! Overlay outbound
//!
//! Opens one fresh overlay stream per connection attempt. The port header is
//! written by the caller so open and header failures can be told apart.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::error::OverlayError;
use crate::overlay::{OverlayStream, OverlayTransport, PeerId};

/// Opens forwarder streams on an overlay transport
#[derive(Clone)]
pub struct OverlayOutbound {
    transport: Arc<dyn OverlayTransport>,
    protocol_id: String,
    open_timeout: Duration,
}

impl OverlayOutbound {
    /// Create an outbound speaking `protocol_id` over `transport`
    pub fn new(
        transport: Arc<dyn OverlayTransport>,
        protocol_id: impl Into<String>,
        open_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            protocol_id: protocol_id.into(),
            open_timeout,
        }
    }

    /// Protocol id used for opened streams
    #[must_use]
    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn OverlayTransport> {
        &self.transport
    }

    /// Open a new stream to `peer`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or `OverlayError::Timeout` when the
    /// stream is not open within the configured timeout.
    pub async fn open(&self, peer: &PeerId) -> Result<OverlayStream, OverlayError> {
        match timeout(
            self.open_timeout,
            self.transport.open_stream(peer, &self.protocol_id),
        )
        .await
        {
            Ok(Ok(stream)) => {
                debug!(%peer, protocol = %self.protocol_id, "overlay stream opened");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(OverlayError::Timeout {
                peer: peer.to_string(),
                timeout_ms: u64::try_from(self.open_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl std::fmt::Debug for OverlayOutbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayOutbound")
            .field("local_peer", self.transport.local_peer())
            .field("protocol_id", &self.protocol_id)
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}
