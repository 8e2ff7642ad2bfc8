//! Peer connection registry
//!
//! Maps each peer identity to the engine connection carrying its traffic.
//! The host uses it to route spawn requests and inbound datagrams to the
//! right connection; the client holds a single entry for the host.

use std::collections::HashMap;
use std::time::Instant;

use crate::identity::PeerIdentity;
use crate::transport::ConnectionId;

// ============================================================================
// Peer Connection
// ============================================================================

/// Where a connection's traffic comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// The host's own player, served in-process
    Local,
    /// A remote peer reached over the relay
    Remote,
}

/// Logical connection bound to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    pub peer: PeerIdentity,
    pub conn: ConnectionId,
    pub kind: ConnectionKind,
    pub established_at: Instant,
}

impl PeerConnection {
    pub fn local(peer: PeerIdentity, conn: ConnectionId) -> Self {
        Self {
            peer,
            conn,
            kind: ConnectionKind::Local,
            established_at: Instant::now(),
        }
    }

    pub fn remote(peer: PeerIdentity, conn: ConnectionId) -> Self {
        Self {
            peer,
            conn,
            kind: ConnectionKind::Remote,
            established_at: Instant::now(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind == ConnectionKind::Remote
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Peer identity to connection mapping
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<PeerIdentity, PeerConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection; a re-insert for the same peer replaces the old entry
    ///
    /// Returns the replaced entry so reconnection logic can release it.
    pub fn insert(&mut self, connection: PeerConnection) -> Option<PeerConnection> {
        log::info!(
            "Registering {:?} connection {} for peer {}",
            connection.kind,
            connection.conn,
            connection.peer
        );
        let previous = self.connections.insert(connection.peer, connection);
        if let Some(ref old) = previous {
            log::info!("Replaced connection {} for peer {}", old.conn, old.peer);
        }
        previous
    }

    pub fn lookup(&self, peer: PeerIdentity) -> Option<&PeerConnection> {
        let found = self.connections.get(&peer);
        if found.is_none() {
            log::debug!("No connection registered for peer {}", peer);
        }
        found
    }

    /// Reverse lookup by engine connection handle
    pub fn peer_for_connection(&self, conn: ConnectionId) -> Option<PeerIdentity> {
        self.connections
            .values()
            .find(|c| c.conn == conn)
            .map(|c| c.peer)
    }

    pub fn remove(&mut self, peer: PeerIdentity) -> Option<PeerConnection> {
        let removed = self.connections.remove(&peer);
        if let Some(ref c) = removed {
            log::info!(
                "Unregistered connection {} for peer {} after {:?}",
                c.conn,
                c.peer,
                c.established_at.elapsed()
            );
        }
        removed
    }

    /// Remote peers currently registered
    pub fn remote_peers(&self) -> Vec<PeerIdentity> {
        self.connections
            .values()
            .filter(|c| c.is_remote())
            .map(|c| c.peer)
            .collect()
    }

    pub fn clear(&mut self) {
        if !self.connections.is_empty() {
            log::info!("Clearing {} registered connections", self.connections.len());
        }
        self.connections.clear();
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
