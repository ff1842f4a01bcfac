//! Outbound module
//!
//! Legs that leave the virtual network:
//!
//! - `DirectOutbound`: host kernel TCP dial with keepalive.
//! - `OverlayOutbound`: a fresh overlay stream to the peer claiming the
//!   destination.

mod direct;
mod overlay;
mod traits;

pub use direct::{DirectOutbound, KEEPALIVE_INTERVAL, KEEPALIVE_TIME};
pub use overlay::OverlayOutbound;
pub use traits::Outbound;
