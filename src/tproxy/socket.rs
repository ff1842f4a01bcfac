//! TPROXY socket utilities
//!
//! Low-level socket operations for the kernel-backed stack:
//! - `IP_TRANSPARENT`: accept TPROXY-redirected guest connections
//! - `SO_ORIGINAL_DST`: read the guest's original destination
//! - `SO_LINGER` 0: reset a rejected guest connection instead of closing it

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

use crate::error::TproxyError;

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Create a TCP socket with `IP_TRANSPARENT` enabled.
///
/// # Errors
///
/// Returns `TproxyError::SocketCreation` if socket creation fails,
/// `TproxyError::PermissionDenied` without `CAP_NET_ADMIN`, or
/// `TproxyError::SocketOption` if another option cannot be set.
pub fn create_tproxy_tcp_socket() -> Result<Socket, TproxyError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TproxyError::SocketCreation(e.to_string()))?;

    set_ip_transparent(&socket)?;

    socket
        .set_reuse_address(true)
        .map_err(|e| TproxyError::socket_option("SO_REUSEADDR", e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TproxyError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("Created TPROXY TCP socket with IP_TRANSPARENT enabled");
    Ok(socket)
}

/// Set `IP_TRANSPARENT` socket option.
fn set_ip_transparent(socket: &Socket) -> Result<(), TproxyError> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            IP_TRANSPARENT,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(TproxyError::PermissionDenied);
        }
        return Err(TproxyError::socket_option("IP_TRANSPARENT", err.to_string()));
    }

    Ok(())
}

/// Get the original destination address of a redirected TCP connection.
///
/// # Errors
///
/// Returns `TproxyError::OriginalDstError` if the socket carries no
/// original destination (`ENOPROTOOPT`) or getsockopt fails.
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddr, TproxyError> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            std::ptr::addr_of_mut!(len),
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOPROTOOPT) {
            return Err(TproxyError::OriginalDstError(
                "SO_ORIGINAL_DST not available".into(),
            ));
        }
        return Err(TproxyError::OriginalDstError(format!(
            "getsockopt SO_ORIGINAL_DST failed: {err}"
        )));
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));

    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Make the next close of `socket` send RST instead of FIN.
///
/// # Errors
///
/// Returns `TproxyError::SocketOption` if `SO_LINGER` cannot be set.
pub fn set_reset_on_close<S: AsFd>(socket: &S) -> Result<(), TproxyError> {
    SockRef::from(socket)
        .set_linger(Some(Duration::ZERO))
        .map_err(|e| TproxyError::socket_option("SO_LINGER", e.to_string()))
}

/// Check if the current process has `CAP_NET_ADMIN` capability.
#[must_use]
pub fn has_net_admin_capability() -> bool {
    !matches!(
        create_tproxy_tcp_socket(),
        Err(TproxyError::PermissionDenied)
    )
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
