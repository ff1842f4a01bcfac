//! Peer overlay: transport traits, the port header, and shipped transports
//!
//! - `traits`: `OverlayTransport`, `StreamHandler`, `PeerRegistry`, `PeerId`
//! - `header`: the 2-byte port header carried at the start of each stream
//! - `registry`: in-process address-claim registry
//! - `tcp`: static-peer transport over TCP
//! - `memory`: in-process hub transport

pub mod header;
pub mod memory;
pub mod registry;
pub mod tcp;
mod traits;

pub use header::{decode_port, encode_port, read_port_header, write_port_header, PORT_HEADER_LEN};
pub use memory::{MemoryOverlay, MemoryOverlayHub};
pub use registry::StaticPeerRegistry;
pub use tcp::TcpOverlay;
pub use traits::{
    validate_peer_id, OverlayStream, OverlayTransport, PeerId, PeerRegistry, StreamHandler,
    MAX_PEER_ID_LENGTH,
};
