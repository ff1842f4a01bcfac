//! Guest-facing network stack
//!
//! `traits` defines what the forwarder needs from a stack. `memory` is an
//! in-process implementation; the kernel-backed one lives in `crate::tproxy`.

pub mod memory;
mod traits;

pub use memory::{EndpointFault, GuestConn, MemoryListener, MemoryStack};
pub use traits::{AttemptId, ConnectAttempt, Route, VirtualStack};
