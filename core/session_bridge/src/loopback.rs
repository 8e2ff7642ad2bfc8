//! In-process relay and lobby directory
//!
//! [`LoopbackNetwork`] plays the part of the relay server for peers living in
//! one process: datagrams from a peer the receiver has not accepted are held
//! and announced with a single session request, lobbies have an owner and a
//! bounded member list, and the whole network can be taken offline to
//! simulate an uninitialized platform.
//!
//! Single-threaded: endpoints share state through `Rc<RefCell<_>>`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::channel::{PeerChannel, PeerSessionState};
use crate::directory::{DirectoryEvent, SessionDirectory, Visibility};
use crate::error::BridgeError;
use crate::identity::{generate_session_id, PeerIdentity, SessionId};

/// Datagrams held per unaccepted sender
const MAX_PENDING_PER_PEER: usize = 64;

#[derive(Debug)]
struct Lobby {
    owner: PeerIdentity,
    members: Vec<PeerIdentity>,
    capacity: usize,
    visibility: Visibility,
}

#[derive(Debug, Default)]
struct PeerState {
    inbox: VecDeque<(PeerIdentity, Vec<u8>)>,
    accepted: HashSet<PeerIdentity>,
    pending: HashMap<PeerIdentity, Vec<Vec<u8>>>,
    session_requests: VecDeque<PeerIdentity>,
    directory_events: VecDeque<DirectoryEvent>,
    invites_shown: Vec<SessionId>,
}

#[derive(Debug)]
struct NetworkState {
    online: bool,
    peers: HashMap<PeerIdentity, PeerState>,
    lobbies: HashMap<SessionId, Lobby>,
}

impl NetworkState {
    fn peer_mut(&mut self, peer: PeerIdentity) -> &mut PeerState {
        self.peers.entry(peer).or_default()
    }

    fn check_online(&self) -> Result<(), BridgeError> {
        if self.online {
            Ok(())
        } else {
            Err(BridgeError::PlatformUnavailable)
        }
    }

    fn lobby(&self, id: SessionId) -> Result<&Lobby, BridgeError> {
        self.check_online()?;
        self.lobbies
            .get(&id)
            .ok_or_else(|| BridgeError::Transport(format!("lobby {} not found", id)))
    }
}

// ============================================================================
// Network
// ============================================================================

/// Shared in-process network
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    inner: Rc<RefCell<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetworkState {
                online: true,
                peers: HashMap::new(),
                lobbies: HashMap::new(),
            })),
        }
    }

    /// Register `peer` and return its directory and channel endpoints
    pub fn endpoint(&self, peer: PeerIdentity) -> (LoopbackDirectory, LoopbackChannel) {
        self.inner.borrow_mut().peer_mut(peer);
        (
            LoopbackDirectory {
                network: self.clone(),
                peer,
            },
            LoopbackChannel {
                network: self.clone(),
                peer,
            },
        )
    }

    /// Take `peer` off the network; sends to it fail until it sends again
    pub fn remove_endpoint(&self, peer: PeerIdentity) {
        log::info!("Loopback peer {} removed", peer);
        self.inner.borrow_mut().peers.remove(&peer);
    }

    pub fn set_online(&self, online: bool) {
        log::info!("Loopback network {}", if online { "online" } else { "offline" });
        self.inner.borrow_mut().online = online;
    }

    /// Deliver an out-of-band invite acceptance to `peer`
    pub fn deliver_invite(&self, peer: PeerIdentity, lobby: SessionId) {
        self.inner
            .borrow_mut()
            .peer_mut(peer)
            .directory_events
            .push_back(DirectoryEvent::InviteAccepted(lobby));
    }

    pub fn lobby_members(&self, id: SessionId) -> Vec<PeerIdentity> {
        self.inner
            .borrow()
            .lobbies
            .get(&id)
            .map(|l| l.members.clone())
            .unwrap_or_default()
    }

    pub fn lobby_count(&self) -> usize {
        self.inner.borrow().lobbies.len()
    }

    /// Lobbies for which `peer` opened the invite prompt
    pub fn invites_shown(&self, peer: PeerIdentity) -> Vec<SessionId> {
        self.inner
            .borrow()
            .peers
            .get(&peer)
            .map(|p| p.invites_shown.clone())
            .unwrap_or_default()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Channel Endpoint
// ============================================================================

#[derive(Debug)]
pub struct LoopbackChannel {
    network: LoopbackNetwork,
    peer: PeerIdentity,
}

impl PeerChannel for LoopbackChannel {
    fn is_ready(&self) -> bool {
        self.network.inner.borrow().online
    }

    fn send(&mut self, to: PeerIdentity, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut net = self.network.inner.borrow_mut();
        net.check_online()?;
        if !net.peers.contains_key(&to) {
            return Err(BridgeError::Transport(format!("peer {} unreachable", to)));
        }

        // Sending to a peer accepts its replies, including held ones
        let me = net.peer_mut(self.peer);
        me.accepted.insert(to);
        if let Some(held) = me.pending.remove(&to) {
            me.inbox.extend(held.into_iter().map(|bytes| (to, bytes)));
        }

        let from = self.peer;
        let receiver = net.peer_mut(to);
        if receiver.accepted.contains(&from) {
            receiver.inbox.push_back((from, bytes.to_vec()));
            return Ok(());
        }

        let held = receiver.pending.entry(from).or_default();
        if held.is_empty() {
            receiver.session_requests.push_back(from);
        }
        if held.len() < MAX_PENDING_PER_PEER {
            held.push(bytes.to_vec());
        } else {
            log::debug!("Pending queue for {} -> {} full, dropping", from, to);
        }
        Ok(())
    }

    fn poll_available(&mut self) -> Option<usize> {
        let net = self.network.inner.borrow();
        net.peers
            .get(&self.peer)
            .and_then(|p| p.inbox.front())
            .map(|(_, bytes)| bytes.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, PeerIdentity), BridgeError> {
        let mut net = self.network.inner.borrow_mut();
        let (sender, bytes) = net
            .peer_mut(self.peer)
            .inbox
            .pop_front()
            .ok_or_else(|| BridgeError::Transport("no datagram available".to_string()))?;
        if bytes.len() > buf.len() {
            return Err(BridgeError::DatagramTooLarge {
                sender,
                size: bytes.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok((bytes.len(), sender))
    }

    fn accept_session(&mut self, peer: PeerIdentity) {
        let mut net = self.network.inner.borrow_mut();
        let me = net.peer_mut(self.peer);
        me.accepted.insert(peer);
        if let Some(held) = me.pending.remove(&peer) {
            log::debug!("Releasing {} held datagram(s) from {}", held.len(), peer);
            me.inbox.extend(held.into_iter().map(|bytes| (peer, bytes)));
        }
    }

    fn session_state(&self, peer: PeerIdentity) -> PeerSessionState {
        let net = self.network.inner.borrow();
        let ours = net
            .peers
            .get(&self.peer)
            .map(|p| p.accepted.contains(&peer))
            .unwrap_or(false);
        let theirs = net
            .peers
            .get(&peer)
            .map(|p| p.accepted.contains(&self.peer))
            .unwrap_or(false);
        match (ours, theirs) {
            (true, true) => PeerSessionState::Established,
            (true, false) => PeerSessionState::Connecting,
            _ => PeerSessionState::None,
        }
    }

    fn close_session(&mut self, peer: PeerIdentity) {
        let mut net = self.network.inner.borrow_mut();
        let me = net.peer_mut(self.peer);
        me.accepted.remove(&peer);
        me.pending.remove(&peer);
    }

    fn poll_session_request(&mut self) -> Option<PeerIdentity> {
        self.network
            .inner
            .borrow_mut()
            .peer_mut(self.peer)
            .session_requests
            .pop_front()
    }
}

// ============================================================================
// Directory Endpoint
// ============================================================================

#[derive(Debug)]
pub struct LoopbackDirectory {
    network: LoopbackNetwork,
    peer: PeerIdentity,
}

impl LoopbackDirectory {
    fn push_event(&self, event: DirectoryEvent) {
        self.network
            .inner
            .borrow_mut()
            .peer_mut(self.peer)
            .directory_events
            .push_back(event);
    }
}

impl SessionDirectory for LoopbackDirectory {
    fn is_ready(&self) -> bool {
        self.network.inner.borrow().online
    }

    fn create_session(
        &mut self,
        visibility: Visibility,
        max_members: usize,
    ) -> Result<(), BridgeError> {
        let id = {
            let mut net = self.network.inner.borrow_mut();
            net.check_online()?;
            let mut id = generate_session_id();
            while net.lobbies.contains_key(&id) {
                id = generate_session_id();
            }
            net.lobbies.insert(
                id,
                Lobby {
                    owner: self.peer,
                    members: vec![self.peer],
                    capacity: max_members.max(1),
                    visibility,
                },
            );
            id
        };
        log::debug!("Loopback lobby {} created by {}", id, self.peer);
        self.push_event(DirectoryEvent::SessionEntered(id));
        Ok(())
    }

    fn join_session(&mut self, id: SessionId) -> Result<(), BridgeError> {
        let outcome = {
            let mut net = self.network.inner.borrow_mut();
            net.check_online()?;
            match net.lobbies.get_mut(&id) {
                None => Err("lobby not found"),
                Some(lobby) if lobby.members.contains(&self.peer) => Ok(()),
                Some(lobby) if lobby.members.len() >= lobby.capacity => Err("lobby full"),
                Some(lobby) => {
                    lobby.members.push(self.peer);
                    Ok(())
                }
            }
        };
        let event = match outcome {
            Ok(()) => DirectoryEvent::SessionEntered(id),
            Err(reason) => DirectoryEvent::SessionEnterFailed {
                session: Some(id),
                reason: reason.to_string(),
            },
        };
        self.push_event(event);
        Ok(())
    }

    fn leave_session(&mut self, id: SessionId) {
        let mut net = self.network.inner.borrow_mut();
        let empty = match net.lobbies.get_mut(&id) {
            Some(lobby) => {
                lobby.members.retain(|m| *m != self.peer);
                if lobby.owner == self.peer {
                    if let Some(&next) = lobby.members.first() {
                        lobby.owner = next;
                    }
                }
                lobby.members.is_empty()
            }
            None => return,
        };
        if empty {
            net.lobbies.remove(&id);
            log::debug!("Loopback lobby {} closed", id);
        }
    }

    fn owner(&self, id: SessionId) -> Result<PeerIdentity, BridgeError> {
        self.network.inner.borrow().lobby(id).map(|l| l.owner)
    }

    fn members(&self, id: SessionId) -> Result<Vec<PeerIdentity>, BridgeError> {
        self.network.inner.borrow().lobby(id).map(|l| l.members.clone())
    }

    fn local_identity(&self) -> Result<PeerIdentity, BridgeError> {
        self.network.inner.borrow().check_online()?;
        Ok(self.peer)
    }

    fn show_invite_dialog(&mut self, id: SessionId) {
        let visibility = self
            .network
            .inner
            .borrow()
            .lobbies
            .get(&id)
            .map(|l| l.visibility);
        log::info!("Invite prompt for lobby {} ({:?})", id, visibility);
        self.network
            .inner
            .borrow_mut()
            .peer_mut(self.peer)
            .invites_shown
            .push(id);
    }

    fn poll_event(&mut self) -> Option<DirectoryEvent> {
        self.network
            .inner
            .borrow_mut()
            .peer_mut(self.peer)
            .directory_events
            .pop_front()
    }
}

// ============================================================================
// Tests
// ============================================================================
