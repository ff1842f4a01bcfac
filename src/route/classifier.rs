//! Reserved-destination classifier
//!
//! Guests must never reach host-local services in the link-local range (cloud
//! metadata endpoints live at 169.254.169.254). Attempts to such destinations
//! are completed without forwarding.

use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};

/// IPv4 link-local range, 169.254.0.0/16
pub const LINK_LOCAL_V4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(169, 254, 0, 0), 16);

/// Check `addr` against the default reserved range
#[must_use]
pub fn is_reserved(addr: IpAddr) -> bool {
    match addr.to_canonical() {
        IpAddr::V4(v4) => LINK_LOCAL_V4.contains(&v4),
        IpAddr::V6(_) => false,
    }
}

/// A configurable set of reserved subnets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedRanges {
    nets: Vec<IpNet>,
}

impl ReservedRanges {
    /// Build from a list of subnets
    pub fn new(nets: impl IntoIterator<Item = IpNet>) -> Self {
        Self {
            nets: nets.into_iter().map(|n| n.trunc()).collect(),
        }
    }

    /// Only the IPv4 link-local range
    #[must_use]
    pub fn link_local() -> Self {
        Self::new([IpNet::V4(LINK_LOCAL_V4)])
    }

    /// A set that reserves nothing
    #[must_use]
    pub fn none() -> Self {
        Self { nets: Vec::new() }
    }

    /// Whether `addr` falls in any reserved subnet
    ///
    /// IPv4-mapped IPv6 addresses are checked as their IPv4 form.
    #[must_use]
    pub fn is_reserved(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.nets.iter().any(|net| net.contains(&addr))
    }

    /// The configured subnets
    #[must_use]
    pub fn subnets(&self) -> &[IpNet] {
        &self.nets
    }
}

impl Default for ReservedRanges {
    fn default() -> Self {
        Self::link_local()
    }
}
