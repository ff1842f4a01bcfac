//! Kernel-backed guest stack using TPROXY
//!
//! Guest TCP leaving the tap interface is redirected to a transparent
//! listener, and each accepted socket becomes a connection attempt.
//!
//! # Requirements
//!
//! - Linux kernel with TPROXY support
//! - `CAP_NET_ADMIN` capability (or root)
//! - iptables with the TPROXY target (`xt_TPROXY`)
//!
//! # Example iptables Setup
//!
//! ```bash
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//!
//! iptables -t mangle -A PREROUTING -i tap0 -p tcp -j TPROXY \
//!     --on-ip 127.0.0.1 --on-port 7894 --tproxy-mark 0x1
//! ```
//!
//! `net.ipv4.conf.all.route_localnet=1` is required for `--on-ip 127.0.0.1`.

mod connection;
mod listener;
mod socket;
mod stack;

pub use connection::TproxyConnection;
pub use listener::TproxyListener;
pub use socket::{
    create_tproxy_tcp_socket, get_original_dst, has_net_admin_capability, is_root,
    set_reset_on_close, IP_TRANSPARENT, SO_ORIGINAL_DST,
};
pub use stack::{parse_proc_net_route, TproxyAttempt, TproxyStack};
