//! Registered peers of the relay

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use session_bridge::PeerIdentity;

// ============================================================================
// Peer Record
// ============================================================================

/// A peer that announced itself with Hello
#[derive(Debug, Clone)]
pub struct RelayPeer {
    /// Address datagrams for this peer are sent to
    pub addr: SocketAddr,
    pub registered_at: Instant,
}

// ============================================================================
// Peer Table
// ============================================================================

/// Identity ↔ address bindings
#[derive(Debug, Default)]
pub struct PeerTable {
    by_identity: HashMap<PeerIdentity, RelayPeer>,
    by_addr: HashMap<SocketAddr, PeerIdentity>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `addr`, replacing any previous binding of either
    pub fn register(&mut self, identity: PeerIdentity, addr: SocketAddr) {
        if let Some(old) = self.by_identity.remove(&identity) {
            self.by_addr.remove(&old.addr);
            if old.addr != addr {
                log::info!(
                    "Peer {} rebound {} -> {} (bound {:?} ago)",
                    identity,
                    old.addr,
                    addr,
                    old.registered_at.elapsed()
                );
            }
        }
        if let Some(previous) = self.by_addr.remove(&addr) {
            self.by_identity.remove(&previous);
            log::info!("Address {} taken over from peer {} by {}", addr, previous, identity);
        }

        log::info!("Registered peer {} at {}", identity, addr);
        self.by_addr.insert(addr, identity);
        self.by_identity.insert(
            identity,
            RelayPeer {
                addr,
                registered_at: Instant::now(),
            },
        );
    }

    pub fn identity_for(&self, addr: SocketAddr) -> Option<PeerIdentity> {
        self.by_addr.get(&addr).copied()
    }

    pub fn addr_of(&self, identity: PeerIdentity) -> Option<SocketAddr> {
        self.by_identity.get(&identity).map(|p| p.addr)
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut table = PeerTable::new();
        table.register(PeerIdentity(100), addr(5000));

        assert_eq!(table.identity_for(addr(5000)), Some(PeerIdentity(100)));
        assert_eq!(table.addr_of(PeerIdentity(100)), Some(addr(5000)));
        assert_eq!(table.addr_of(PeerIdentity(200)), None);
    }

    #[test]
    fn test_rebind_to_new_address() {
        let mut table = PeerTable::new();
        table.register(PeerIdentity(100), addr(5000));
        table.register(PeerIdentity(100), addr(5001));

        assert_eq!(table.len(), 1);
        assert_eq!(table.identity_for(addr(5000)), None);
        assert_eq!(table.addr_of(PeerIdentity(100)), Some(addr(5001)));
    }

    #[test]
    fn test_address_takeover() {
        let mut table = PeerTable::new();
        table.register(PeerIdentity(100), addr(5000));
        table.register(PeerIdentity(200), addr(5000));

        assert_eq!(table.len(), 1);
        assert_eq!(table.identity_for(addr(5000)), Some(PeerIdentity(200)));
        assert_eq!(table.addr_of(PeerIdentity(100)), None);
    }
}
