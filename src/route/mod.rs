//! Routing policy for guest connection attempts
//!
//! - `classifier`: reserved destinations that are never forwarded
//! - `nat`: virtual-stack to host address translation
//! - `decision`: the per-attempt decision built from both plus the peer registry

pub mod classifier;
pub mod decision;
pub mod nat;

pub use classifier::{is_reserved, ReservedRanges, LINK_LOCAL_V4};
pub use decision::{RouteDecision, RouteKind, Router};
pub use nat::{NatEntries, NatTable, Resolution};
