//! Directory and channel endpoints backed by the relay server
//!
//! One UDP socket carries both lobby traffic and peer datagrams. Inbound
//! messages are sorted into per-endpoint queues by [`RelayLink::pump`]; the
//! bridge then reads them through [`LobbyDirectory`] and [`RelayChannel`].

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::net::UdpSocket;
use session_bridge::protocol::{RelayError, RelayMessage, MAX_DATAGRAM_SIZE};
use session_bridge::{
    BridgeError, DirectoryEvent, PeerChannel, PeerIdentity, PeerSessionState, SessionDirectory,
    SessionId, Visibility, CONNECT_LOBBY_ARG,
};

// ============================================================================
// Relay View
// ============================================================================

#[derive(Debug, Clone)]
struct LobbyView {
    owner: PeerIdentity,
    members: Vec<PeerIdentity>,
}

/// What this node knows from relay messages so far
#[derive(Debug)]
struct RelayView {
    identity: PeerIdentity,
    registered: bool,
    inbox: VecDeque<(PeerIdentity, Vec<u8>)>,
    accepted: HashSet<PeerIdentity>,
    heard_from: HashSet<PeerIdentity>,
    /// Peers the relay reported unreachable, surfaced on the next send
    unreachable: HashSet<PeerIdentity>,
    session_requests: VecDeque<PeerIdentity>,
    events: VecDeque<DirectoryEvent>,
    lobbies: HashMap<SessionId, LobbyView>,
}

impl RelayView {
    fn new(identity: PeerIdentity) -> Self {
        RelayView {
            identity,
            registered: false,
            inbox: VecDeque::new(),
            accepted: HashSet::new(),
            heard_from: HashSet::new(),
            unreachable: HashSet::new(),
            session_requests: VecDeque::new(),
            events: VecDeque::new(),
            lobbies: HashMap::new(),
        }
    }

    /// Apply one relay message, returning a reply to send if one is needed
    fn apply(&mut self, msg: RelayMessage) -> Option<RelayMessage> {
        match msg {
            RelayMessage::Welcome { peer } if peer == self.identity => {
                if !self.registered {
                    log::info!("Registered with relay as {}", peer);
                }
                self.registered = true;
            }
            RelayMessage::LobbyEntered {
                lobby,
                owner,
                members,
            } => {
                self.lobbies.insert(lobby, LobbyView { owner, members });
                self.events.push_back(DirectoryEvent::SessionEntered(lobby));
            }
            RelayMessage::LobbyUpdated {
                lobby,
                owner,
                members,
            } => {
                if let Some(view) = self.lobbies.get_mut(&lobby) {
                    log::info!("Lobby {} now {} member(s), owner {}", lobby, members.len(), owner);
                    view.owner = owner;
                    view.members = members;
                }
            }
            RelayMessage::LobbyEnterFailed { lobby, code } => {
                self.events.push_back(DirectoryEvent::SessionEnterFailed {
                    session: lobby,
                    reason: code.to_string(),
                });
            }
            RelayMessage::Datagram { peer, payload } => {
                log::trace!("Datagram from {} ({} bytes)", peer, payload.len());
                self.heard_from.insert(peer);
                self.inbox.push_back((peer, payload));
            }
            RelayMessage::SessionRequest { peer } => self.session_requests.push_back(peer),
            RelayMessage::SendFailed { peer, code } => {
                log::warn!("Relay could not reach {}: {}", peer, code);
                self.heard_from.remove(&peer);
                self.unreachable.insert(peer);
            }
            RelayMessage::Error {
                code: RelayError::NotRegistered,
                ..
            } => {
                log::warn!("Relay forgot us, registering again");
                self.registered = false;
                return Some(RelayMessage::Hello {
                    peer: self.identity,
                });
            }
            RelayMessage::Error { code, message } => {
                log::warn!("Relay error {}: {}", code, message);
            }
            other => log::debug!("Ignoring unexpected relay message {:?}", other),
        }
        None
    }

    fn check_registered(&self) -> Result<(), BridgeError> {
        if self.registered {
            Ok(())
        } else {
            Err(BridgeError::PlatformUnavailable)
        }
    }

    fn lobby(&self, id: SessionId) -> Result<&LobbyView, BridgeError> {
        self.check_registered()?;
        self.lobbies
            .get(&id)
            .ok_or_else(|| BridgeError::Transport(format!("lobby {} not known", id)))
    }
}

// ============================================================================
// Link
// ============================================================================

struct LinkState {
    socket: UdpSocket,
    relay: SocketAddr,
    view: RelayView,
    recv_buf: Vec<u8>,
}

impl LinkState {
    fn send(&self, msg: &RelayMessage) -> Result<(), BridgeError> {
        let bytes = msg.encode().map_err(BridgeError::Encode)?;
        self.socket
            .send_to(&bytes, self.relay)
            .map(|_| ())
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// Send, logging instead of failing; for trait methods with no error path
    fn send_or_log(&self, msg: &RelayMessage) {
        if let Err(e) = self.send(msg) {
            log::warn!("Failed to send {:?} to relay: {}", msg, e);
        }
    }
}

/// Shared connection to the relay server
#[derive(Clone)]
pub struct RelayLink {
    inner: Rc<RefCell<LinkState>>,
}

impl RelayLink {
    /// Wrap a socket already registered with the poll
    pub fn new(socket: UdpSocket, relay: SocketAddr, identity: PeerIdentity) -> Self {
        RelayLink {
            inner: Rc::new(RefCell::new(LinkState {
                socket,
                relay,
                view: RelayView::new(identity),
                recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            })),
        }
    }

    pub fn endpoints(&self) -> (LobbyDirectory, RelayChannel) {
        (
            LobbyDirectory { link: self.clone() },
            RelayChannel { link: self.clone() },
        )
    }

    /// Announce our identity to the relay
    pub fn hello(&self) -> Result<(), BridgeError> {
        let state = self.inner.borrow();
        state.send(&RelayMessage::Hello {
            peer: state.view.identity,
        })
    }

    pub fn is_registered(&self) -> bool {
        self.inner.borrow().view.registered
    }

    /// Read every pending datagram from the socket, returning how many
    pub fn pump(&self) -> Result<usize, BridgeError> {
        let mut guard = self.inner.borrow_mut();
        let state = &mut *guard;
        let mut count = 0;

        loop {
            let (len, from) = match state.socket.recv_from(&mut state.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(BridgeError::Transport(e.to_string())),
            };
            if from != state.relay {
                log::debug!("Ignoring {} bytes from non-relay address {}", len, from);
                continue;
            }

            count += 1;
            let msg = match RelayMessage::decode(&state.recv_buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    log::debug!("Undecodable relay message: {}", e);
                    continue;
                }
            };
            if let Some(reply) = state.view.apply(msg) {
                state.send_or_log(&reply);
            }
        }

        Ok(count)
    }
}

// ============================================================================
// Directory Endpoint
// ============================================================================

pub struct LobbyDirectory {
    link: RelayLink,
}

impl SessionDirectory for LobbyDirectory {
    fn is_ready(&self) -> bool {
        self.link.is_registered()
    }

    fn create_session(
        &mut self,
        visibility: Visibility,
        max_members: usize,
    ) -> Result<(), BridgeError> {
        let state = self.link.inner.borrow();
        state.view.check_registered()?;
        state.send(&RelayMessage::CreateLobby {
            visibility,
            capacity: u32::try_from(max_members).unwrap_or(u32::MAX),
        })
    }

    fn join_session(&mut self, id: SessionId) -> Result<(), BridgeError> {
        let state = self.link.inner.borrow();
        state.view.check_registered()?;
        state.send(&RelayMessage::JoinLobby { lobby: id })
    }

    fn leave_session(&mut self, id: SessionId) {
        let mut state = self.link.inner.borrow_mut();
        state.view.lobbies.remove(&id);
        state.send_or_log(&RelayMessage::LeaveLobby { lobby: id });
    }

    fn owner(&self, id: SessionId) -> Result<PeerIdentity, BridgeError> {
        self.link.inner.borrow().view.lobby(id).map(|l| l.owner)
    }

    fn members(&self, id: SessionId) -> Result<Vec<PeerIdentity>, BridgeError> {
        self.link
            .inner
            .borrow()
            .view
            .lobby(id)
            .map(|l| l.members.clone())
    }

    fn local_identity(&self) -> Result<PeerIdentity, BridgeError> {
        let state = self.link.inner.borrow();
        state.view.check_registered()?;
        Ok(state.view.identity)
    }

    fn show_invite_dialog(&mut self, id: SessionId) {
        let relay = self.link.inner.borrow().relay;
        log::info!(
            "Invite a friend: lobby-node --relay {} {} {}",
            relay,
            CONNECT_LOBBY_ARG,
            id
        );
    }

    fn poll_event(&mut self) -> Option<DirectoryEvent> {
        self.link.inner.borrow_mut().view.events.pop_front()
    }
}

// ============================================================================
// Channel Endpoint
// ============================================================================

pub struct RelayChannel {
    link: RelayLink,
}

impl PeerChannel for RelayChannel {
    fn is_ready(&self) -> bool {
        self.link.is_registered()
    }

    fn send(&mut self, peer: PeerIdentity, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut state = self.link.inner.borrow_mut();
        if state.view.unreachable.remove(&peer) {
            return Err(BridgeError::Transport(format!("peer {} unreachable", peer)));
        }
        state.view.check_registered()?;
        state.view.accepted.insert(peer);
        state.send(&RelayMessage::Datagram {
            peer,
            payload: bytes.to_vec(),
        })
    }

    fn poll_available(&mut self) -> Option<usize> {
        self.link
            .inner
            .borrow()
            .view
            .inbox
            .front()
            .map(|(_, bytes)| bytes.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, PeerIdentity), BridgeError> {
        let (sender, bytes) = self
            .link
            .inner
            .borrow_mut()
            .view
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
        let mut state = self.link.inner.borrow_mut();
        state.view.accepted.insert(peer);
        state.send_or_log(&RelayMessage::AcceptSession { peer });
    }

    fn session_state(&self, peer: PeerIdentity) -> PeerSessionState {
        let state = self.link.inner.borrow();
        let view = &state.view;
        match (view.accepted.contains(&peer), view.heard_from.contains(&peer)) {
            (true, true) => PeerSessionState::Established,
            (true, false) => PeerSessionState::Connecting,
            _ => PeerSessionState::None,
        }
    }

    fn close_session(&mut self, peer: PeerIdentity) {
        let mut state = self.link.inner.borrow_mut();
        state.view.accepted.remove(&peer);
        state.view.heard_from.remove(&peer);
        state.send_or_log(&RelayMessage::CloseSession { peer });
    }

    fn poll_session_request(&mut self) -> Option<PeerIdentity> {
        self.link.inner.borrow_mut().view.session_requests.pop_front()
    }
}

// ============================================================================
// Tests
// ============================================================================
