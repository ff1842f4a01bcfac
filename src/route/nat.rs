//! NAT table
//!
//! Maps virtual-stack addresses to the host-reachable address that should be
//! dialed instead. The table's lock is also the scope in which a routing
//! decision reads the peer registry, so a peer claim and a NAT entry are
//! always observed from one consistent point in time. The lock is only held
//! for in-memory work, never across I/O.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::debug;

use crate::overlay::{PeerId, PeerRegistry};

/// Where an address resolves to, read under one lock scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A peer claims the address
    Peer(PeerId),
    /// No claim; a NAT entry translates the address
    Translated(IpAddr),
    /// Neither a claim nor a NAT entry
    Unmapped,
}

/// Concurrency-safe address translation table
#[derive(Debug, Default)]
pub struct NatTable {
    entries: RwLock<HashMap<IpAddr, IpAddr>>,
}

/// Mutable view of the table inside `NatTable::transaction`
pub struct NatEntries<'a> {
    map: &'a mut HashMap<IpAddr, IpAddr>,
}

impl NatEntries<'_> {
    /// Insert or replace a mapping, returning the previous translation
    pub fn set(&mut self, addr: IpAddr, translated: IpAddr) -> Option<IpAddr> {
        self.map.insert(addr, translated)
    }

    /// Remove a mapping, returning its translation
    pub fn delete(&mut self, addr: IpAddr) -> Option<IpAddr> {
        self.map.remove(&addr)
    }

    /// Current translation for `addr`
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> Option<IpAddr> {
        self.map.get(&addr).copied()
    }
}

impl NatTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from initial entries
    pub fn with_entries(entries: impl IntoIterator<Item = (IpAddr, IpAddr)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Translation for `addr`; `None` is the normal first-contact outcome
    #[must_use]
    pub fn lookup(&self, addr: IpAddr) -> Option<IpAddr> {
        self.entries.read().get(&addr).copied()
    }

    /// Insert or replace a mapping, returning the previous translation
    pub fn set(&self, addr: IpAddr, translated: IpAddr) -> Option<IpAddr> {
        let previous = self.entries.write().insert(addr, translated);
        debug!(%addr, %translated, "NAT entry set");
        previous
    }

    /// Remove a mapping, returning its translation
    pub fn delete(&self, addr: IpAddr) -> Option<IpAddr> {
        let previous = self.entries.write().remove(&addr);
        if previous.is_some() {
            debug!(%addr, "NAT entry deleted");
        }
        previous
    }

    /// Resolve `addr` against the registry and the table under one lock scope
    ///
    /// A peer claim takes precedence over a NAT entry.
    pub fn resolve(&self, addr: IpAddr, registry: &dyn PeerRegistry) -> Resolution {
        let entries = self.entries.read();
        if let Some(peer) = registry.lookup_peer_by_addr(addr) {
            return Resolution::Peer(peer);
        }
        match entries.get(&addr) {
            Some(translated) => Resolution::Translated(*translated),
            None => Resolution::Unmapped,
        }
    }

    /// Run `f` with exclusive access to the table
    ///
    /// Used to change a peer claim and NAT entries together, so no routing
    /// decision observes one change without the other.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut NatEntries<'_>) -> R) -> R {
        let mut guard = self.entries.write();
        let mut entries = NatEntries { map: &mut *guard };
        f(&mut entries)
    }

    /// Snapshot of all entries, ordered by address
    #[must_use]
    pub fn entries(&self) -> Vec<(IpAddr, IpAddr)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(addr, translated)| (*addr, *translated))
            .collect();
        entries.sort_unstable();
        entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
