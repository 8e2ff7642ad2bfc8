//! Lobby registry
//!
//! A lobby has one owner and a bounded member list in join order. When the
//! owner leaves, the longest-standing remaining member takes over; the last
//! member leaving deletes the lobby.

use std::collections::HashMap;
use std::time::Instant;

use ring::rand::{SecureRandom, SystemRandom};
use session_bridge::protocol::RelayError;
use session_bridge::{PeerIdentity, SessionId, Visibility};

// ============================================================================
// Lobby
// ============================================================================

#[derive(Debug, Clone)]
pub struct Lobby {
    pub id: SessionId,
    pub owner: PeerIdentity,
    /// Members in join order, owner included
    pub members: Vec<PeerIdentity>,
    pub capacity: usize,
    pub visibility: Visibility,
    pub created_at: Instant,
}

impl Lobby {
    pub fn is_member(&self, peer: PeerIdentity) -> bool {
        self.members.contains(&peer)
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct Joined {
    pub lobby: Lobby,
    /// False when the peer was already a member
    pub newly_joined: bool,
}

/// Result of a leave
#[derive(Debug, Clone)]
pub enum LeaveOutcome {
    NotMember,
    /// Lobby still has members
    Remaining(Lobby),
    Closed,
}

// ============================================================================
// Registry
// ============================================================================

pub struct LobbyRegistry {
    lobbies: HashMap<SessionId, Lobby>,
    rng: SystemRandom,
}

impl LobbyRegistry {
    pub fn new() -> Self {
        LobbyRegistry {
            lobbies: HashMap::new(),
            rng: SystemRandom::new(),
        }
    }

    fn allocate_id(&self) -> Result<SessionId, RelayError> {
        let mut buf = [0u8; 8];
        loop {
            self.rng.fill(&mut buf).map_err(|_| RelayError::Unknown)?;
            let id = SessionId(u64::from_be_bytes(buf));
            if id.0 != 0 && !self.lobbies.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    /// Create a lobby owned by `owner`
    pub fn create(
        &mut self,
        owner: PeerIdentity,
        visibility: Visibility,
        capacity: u32,
    ) -> Result<Lobby, RelayError> {
        let id = self.allocate_id()?;
        let lobby = Lobby {
            id,
            owner,
            members: vec![owner],
            capacity: (capacity as usize).max(1),
            visibility,
            created_at: Instant::now(),
        };
        log::info!(
            "Lobby {} created by {} ({:?}, capacity {})",
            id,
            owner,
            visibility,
            lobby.capacity
        );
        self.lobbies.insert(id, lobby.clone());
        Ok(lobby)
    }

    pub fn join(&mut self, id: SessionId, peer: PeerIdentity) -> Result<Joined, RelayError> {
        let lobby = self.lobbies.get_mut(&id).ok_or(RelayError::LobbyNotFound)?;
        if lobby.is_member(peer) {
            return Ok(Joined {
                lobby: lobby.clone(),
                newly_joined: false,
            });
        }
        if lobby.is_full() {
            log::info!("Peer {} refused: lobby {} full", peer, id);
            return Err(RelayError::LobbyFull);
        }

        lobby.members.push(peer);
        log::info!(
            "Peer {} joined {:?} lobby {} ({} members)",
            peer,
            lobby.visibility,
            id,
            lobby.members.len()
        );
        Ok(Joined {
            lobby: lobby.clone(),
            newly_joined: true,
        })
    }

    pub fn leave(&mut self, id: SessionId, peer: PeerIdentity) -> LeaveOutcome {
        let lobby = match self.lobbies.get_mut(&id) {
            Some(lobby) if lobby.is_member(peer) => lobby,
            _ => return LeaveOutcome::NotMember,
        };

        lobby.members.retain(|m| *m != peer);
        log::info!("Peer {} left lobby {}", peer, id);

        if lobby.members.is_empty() {
            log::info!(
                "Lobby {} closed after {:?}",
                id,
                lobby.created_at.elapsed()
            );
            self.lobbies.remove(&id);
            return LeaveOutcome::Closed;
        }
        if lobby.owner == peer {
            lobby.owner = lobby.members[0];
            log::info!("Lobby {} ownership passed to {}", id, lobby.owner);
        }
        LeaveOutcome::Remaining(lobby.clone())
    }

    pub fn len(&self) -> usize {
        self.lobbies.len()
    }
}

impl Default for LobbyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerIdentity = PeerIdentity(100);
    const B: PeerIdentity = PeerIdentity(200);
    const C: PeerIdentity = PeerIdentity(300);

    #[test]
    fn test_create_and_join() {
        let mut registry = LobbyRegistry::new();
        let lobby = registry.create(A, Visibility::Private, 2).unwrap();
        assert_eq!(lobby.owner, A);
        assert_ne!(lobby.id.0, 0);

        let joined = registry.join(lobby.id, B).unwrap();
        assert!(joined.newly_joined);
        assert_eq!(joined.lobby.members, vec![A, B]);

        let again = registry.join(lobby.id, B).unwrap();
        assert!(!again.newly_joined);
    }

    #[test]
    fn test_join_errors() {
        let mut registry = LobbyRegistry::new();
        let lobby = registry.create(A, Visibility::Public, 2).unwrap();
        registry.join(lobby.id, B).unwrap();

        assert_eq!(registry.join(lobby.id, C).unwrap_err(), RelayError::LobbyFull);
        assert_eq!(
            registry.join(SessionId(1), C).unwrap_err(),
            RelayError::LobbyNotFound
        );
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut registry = LobbyRegistry::new();
        let lobby = registry.create(A, Visibility::Private, 0).unwrap();
        assert_eq!(lobby.capacity, 1);
        assert_eq!(registry.join(lobby.id, B).unwrap_err(), RelayError::LobbyFull);
    }

    #[test]
    fn test_owner_leave_transfers_ownership() {
        let mut registry = LobbyRegistry::new();
        let lobby = registry.create(A, Visibility::Private, 3).unwrap();
        registry.join(lobby.id, B).unwrap();
        registry.join(lobby.id, C).unwrap();

        match registry.leave(lobby.id, A) {
            LeaveOutcome::Remaining(l) => {
                assert_eq!(l.owner, B);
                assert_eq!(l.members, vec![B, C]);
            }
            other => panic!("Expected Remaining, got {:?}", other),
        }
    }

    #[test]
    fn test_last_leave_closes_lobby() {
        let mut registry = LobbyRegistry::new();
        let lobby = registry.create(A, Visibility::Private, 2).unwrap();

        assert!(matches!(registry.leave(lobby.id, B), LeaveOutcome::NotMember));
        assert!(matches!(registry.leave(lobby.id, A), LeaveOutcome::Closed));
        assert_eq!(registry.len(), 0);
    }
}
