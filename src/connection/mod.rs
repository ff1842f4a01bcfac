//! Connection handling module
//!
//! This module provides connection management, including:
//! - Routing and bridging of attempts from the virtual stack
//! - The inbound overlay listener
//! - Connection limiting with backpressure and graceful shutdown
//! - Statistics collection

mod inbound;
mod manager;
mod stats;
mod tcp;

pub use inbound::{resolve_tap_ip, InboundOverlayListener, FALLBACK_TAP_IP};
pub use manager::{run_accept_loop, ConnectionManager};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use tcp::{handle_attempt, AttemptContext, AttemptOutcome};
