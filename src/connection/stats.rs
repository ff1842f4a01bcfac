//! Connection statistics tracking
//!
//! Lock-free counters shared by the accept loop, attempt handlers and the
//! inbound overlay listener.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::route::RouteKind;

/// Atomic forwarder statistics
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Attempts admitted under the connection limit
    accepted: AtomicU64,
    /// Attempts currently being routed or bridged
    active: AtomicU64,
    /// Attempts rejected because the destination is reserved
    rejected_policy: AtomicU64,
    /// Attempts rejected because the connection limit was reached
    rejected_limit: AtomicU64,
    /// Attempts routed to an overlay peer
    overlay: AtomicU64,
    /// Attempts routed to a direct dial
    direct: AtomicU64,
    /// Attempts that reached the bridge
    bridged: AtomicU64,
    /// Attempts abandoned after a failed leg
    failed: AtomicU64,
    /// Overlay streams accepted by the inbound listener
    inbound_streams: AtomicU64,
    /// Inbound streams abandoned before bridging
    inbound_failed: AtomicU64,
    /// Bytes from guest or peer towards the far leg
    bytes_rx: AtomicU64,
    /// Bytes from the far leg back to the guest or peer
    bytes_tx: AtomicU64,
}

impl ConnectionStats {
    /// Create new connection statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt admitted under the limit
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an attempt turned away by the connection limit
    pub fn record_rejected_limit(&self) {
        self.rejected_limit.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted attempt rejected by address policy
    pub fn record_rejected_policy(&self) {
        self.rejected_policy.fetch_add(1, Ordering::Relaxed);
        self.finish();
    }

    /// Record the route chosen for an accepted attempt
    pub fn record_route(&self, route: RouteKind) {
        match route {
            RouteKind::Overlay => self.overlay.fetch_add(1, Ordering::Relaxed),
            RouteKind::Direct => self.direct.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a finished bridge for an accepted attempt
    pub fn record_bridged(&self, bytes_rx: u64, bytes_tx: u64) {
        self.bridged.fetch_add(1, Ordering::Relaxed);
        self.add_bytes(bytes_rx, bytes_tx);
        self.finish();
    }

    /// Record an accepted attempt abandoned after a failed leg
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.finish();
    }

    /// Record an overlay stream delivered to the inbound listener
    pub fn record_inbound_stream(&self) {
        self.inbound_streams.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound stream abandoned before bridging
    pub fn record_inbound_failed(&self) {
        self.inbound_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add relayed byte counts
    pub fn add_bytes(&self, bytes_rx: u64, bytes_tx: u64) {
        self.bytes_rx.fetch_add(bytes_rx, Ordering::Relaxed);
        self.bytes_tx.fetch_add(bytes_tx, Ordering::Relaxed);
    }

    fn finish(&self) {
        // Saturate rather than wrap if a caller double-finishes
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Get admitted attempts
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Get attempts in flight
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Get policy rejections
    #[must_use]
    pub fn rejected_policy(&self) -> u64 {
        self.rejected_policy.load(Ordering::Relaxed)
    }

    /// Get limit rejections
    #[must_use]
    pub fn rejected_limit(&self) -> u64 {
        self.rejected_limit.load(Ordering::Relaxed)
    }

    /// Get attempts routed to the overlay
    #[must_use]
    pub fn overlay(&self) -> u64 {
        self.overlay.load(Ordering::Relaxed)
    }

    /// Get attempts routed to a direct dial
    #[must_use]
    pub fn direct(&self) -> u64 {
        self.direct.load(Ordering::Relaxed)
    }

    /// Get attempts that were bridged
    #[must_use]
    pub fn bridged(&self) -> u64 {
        self.bridged.load(Ordering::Relaxed)
    }

    /// Get failed attempts
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Get inbound overlay streams
    #[must_use]
    pub fn inbound_streams(&self) -> u64 {
        self.inbound_streams.load(Ordering::Relaxed)
    }

    /// Get failed inbound overlay streams
    #[must_use]
    pub fn inbound_failed(&self) -> u64 {
        self.inbound_failed.load(Ordering::Relaxed)
    }

    /// Get total bytes received
    #[must_use]
    pub fn bytes_rx(&self) -> u64 {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    /// Get total bytes transmitted
    #[must_use]
    pub fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted(),
            active: self.active(),
            rejected_policy: self.rejected_policy(),
            rejected_limit: self.rejected_limit(),
            overlay: self.overlay(),
            direct: self.direct(),
            bridged: self.bridged(),
            failed: self.failed(),
            inbound_streams: self.inbound_streams(),
            inbound_failed: self.inbound_failed(),
            bytes_rx: self.bytes_rx(),
            bytes_tx: self.bytes_tx(),
            timestamp_ms: u64::try_from(
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis(),
            )
            .unwrap_or(u64::MAX),
        }
    }
}

/// Snapshot of forwarder statistics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub rejected_policy: u64,
    pub rejected_limit: u64,
    pub overlay: u64,
    pub direct: u64,
    pub bridged: u64,
    pub failed: u64,
    pub inbound_streams: u64,
    pub inbound_failed: u64,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl StatsSnapshot {
    /// Total bytes relayed in both directions
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }

    /// Percentage of routed attempts that reached the bridge
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.bridged + self.failed;
        if total == 0 {
            return 100.0;
        }
        (self.bridged as f64 / total as f64) * 100.0
    }
}
