//! Message dispatch for the relay
//!
//! [`Relay::handle`] turns one inbound message into the replies and
//! forwards it causes. The event loop owns the socket; this module never
//! touches it, so the whole dispatch table is testable without I/O.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use session_bridge::protocol::{RelayError, RelayMessage};
use session_bridge::{PeerIdentity, SessionId};

use crate::client::PeerTable;
use crate::metrics::Metrics;
use crate::registry::{LeaveOutcome, Lobby, LobbyRegistry};
use crate::signaling::{HoldOutcome, SessionTable};

/// Outbound messages produced by one dispatch
pub type Outbox = Vec<(SocketAddr, RelayMessage)>;

pub struct Relay {
    peers: PeerTable,
    lobbies: LobbyRegistry,
    sessions: SessionTable,
    metrics: Metrics,
}

impl Relay {
    pub fn new(request_timeout: Duration) -> Self {
        Relay {
            peers: PeerTable::new(),
            lobbies: LobbyRegistry::new(),
            sessions: SessionTable::new(request_timeout),
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn handle(&mut self, from: SocketAddr, msg: RelayMessage, now: Instant) -> Outbox {
        let mut out = Outbox::new();

        if let RelayMessage::Hello { peer } = msg {
            self.peers.register(peer, from);
            self.metrics
                .registered_peers
                .store(self.peers.len() as u64, Ordering::Relaxed);
            out.push((from, RelayMessage::Welcome { peer }));
            return out;
        }

        let sender = match self.peers.identity_for(from) {
            Some(id) => id,
            None => {
                log::debug!("Message from unregistered address {}", from);
                out.push((
                    from,
                    RelayMessage::error(RelayError::NotRegistered, "send Hello first"),
                ));
                return out;
            }
        };

        match msg {
            RelayMessage::CreateLobby {
                visibility,
                capacity,
            } => match self.lobbies.create(sender, visibility, capacity) {
                Ok(lobby) => out.push((from, entered(&lobby))),
                Err(code) => out.push((from, RelayMessage::LobbyEnterFailed { lobby: None, code })),
            },
            RelayMessage::JoinLobby { lobby } => self.join(sender, from, lobby, &mut out),
            RelayMessage::LeaveLobby { lobby } => {
                if let LeaveOutcome::Remaining(remaining) = self.lobbies.leave(lobby, sender) {
                    self.broadcast_update(&remaining, None, &mut out);
                }
            }
            RelayMessage::Datagram { peer, payload } => {
                self.relay_datagram(sender, from, peer, payload, now, &mut out)
            }
            RelayMessage::AcceptSession { peer } => {
                for payload in self.sessions.accept(sender, peer) {
                    self.metrics.record_relayed(payload.len());
                    out.push((from, RelayMessage::Datagram { peer, payload }));
                }
            }
            RelayMessage::CloseSession { peer } => self.sessions.close(sender, peer),
            other => {
                log::debug!("Peer {} sent server-only message {:?}", sender, other);
                out.push((
                    from,
                    RelayMessage::error(RelayError::InvalidMessage, "unexpected message type"),
                ));
            }
        }

        self.metrics
            .open_lobbies
            .store(self.lobbies.len() as u64, Ordering::Relaxed);
        out
    }

    fn join(&mut self, sender: PeerIdentity, from: SocketAddr, lobby: SessionId, out: &mut Outbox) {
        match self.lobbies.join(lobby, sender) {
            Ok(joined) => {
                if joined.newly_joined {
                    self.broadcast_update(&joined.lobby, Some(sender), out);
                }
                out.push((from, entered(&joined.lobby)));
            }
            Err(code) => {
                log::info!("Peer {} could not join lobby {}: {}", sender, lobby, code);
                out.push((
                    from,
                    RelayMessage::LobbyEnterFailed {
                        lobby: Some(lobby),
                        code,
                    },
                ));
            }
        }
    }

    fn broadcast_update(&self, lobby: &Lobby, skip: Option<PeerIdentity>, out: &mut Outbox) {
        for member in &lobby.members {
            if Some(*member) == skip {
                continue;
            }
            if let Some(addr) = self.peers.addr_of(*member) {
                out.push((
                    addr,
                    RelayMessage::LobbyUpdated {
                        lobby: lobby.id,
                        owner: lobby.owner,
                        members: lobby.members.clone(),
                    },
                ));
            }
        }
    }

    fn relay_datagram(
        &mut self,
        sender: PeerIdentity,
        from: SocketAddr,
        dest: PeerIdentity,
        payload: Vec<u8>,
        now: Instant,
        out: &mut Outbox,
    ) {
        let dest_addr = match self.peers.addr_of(dest) {
            Some(addr) => addr,
            None => {
                self.metrics.send_failures_total.fetch_add(1, Ordering::Relaxed);
                out.push((
                    from,
                    RelayMessage::SendFailed {
                        peer: dest,
                        code: RelayError::PeerUnreachable,
                    },
                ));
                return;
            }
        };

        // Sending to a peer accepts datagrams back from it
        for held in self.sessions.accept(sender, dest) {
            self.metrics.record_relayed(held.len());
            out.push((from, RelayMessage::Datagram { peer: dest, payload: held }));
        }

        if self.sessions.is_accepted(dest, sender) {
            log::trace!("Relaying {} bytes {} -> {}", payload.len(), sender, dest);
            self.metrics.record_relayed(payload.len());
            out.push((dest_addr, RelayMessage::Datagram { peer: sender, payload }));
            return;
        }

        match self.sessions.hold(dest, sender, payload, now) {
            HoldOutcome::NewRequest => {
                log::info!("Session request {} -> {}", sender, dest);
                self.metrics
                    .session_requests_total
                    .fetch_add(1, Ordering::Relaxed);
                out.push((dest_addr, RelayMessage::SessionRequest { peer: sender }));
            }
            HoldOutcome::Held => {}
            HoldOutcome::Dropped => {
                log::warn!("Held datagram buffer full for {} -> {}", sender, dest);
            }
        }
    }

    /// Fail session requests nobody accepted in time
    pub fn expire(&mut self, now: Instant) -> Outbox {
        let mut out = Outbox::new();
        for (receiver, sender) in self.sessions.expire(now) {
            if let Some(addr) = self.peers.addr_of(sender) {
                self.metrics.send_failures_total.fetch_add(1, Ordering::Relaxed);
                out.push((
                    addr,
                    RelayMessage::SendFailed {
                        peer: receiver,
                        code: RelayError::PeerUnreachable,
                    },
                ));
            }
        }
        out
    }
}

fn entered(lobby: &Lobby) -> RelayMessage {
    RelayMessage::LobbyEntered {
        lobby: lobby.id,
        owner: lobby.owner,
        members: lobby.members.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_bridge::Visibility;

    const HOST: PeerIdentity = PeerIdentity(100);
    const CLIENT: PeerIdentity = PeerIdentity(200);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn relay_with_peers() -> Relay {
        let mut relay = Relay::new(Duration::from_secs(10));
        let now = Instant::now();
        relay.handle(addr(1), RelayMessage::Hello { peer: HOST }, now);
        relay.handle(addr(2), RelayMessage::Hello { peer: CLIENT }, now);
        relay
    }

    fn create_lobby(relay: &mut Relay) -> SessionId {
        let out = relay.handle(
            addr(1),
            RelayMessage::CreateLobby {
                visibility: Visibility::Private,
                capacity: 4,
            },
            Instant::now(),
        );
        match &out[0].1 {
            RelayMessage::LobbyEntered { lobby, .. } => *lobby,
            other => panic!("Expected LobbyEntered, got {:?}", other),
        }
    }

    #[test]
    fn test_hello_welcome() {
        let mut relay = Relay::new(Duration::from_secs(10));
        let out = relay.handle(addr(1), RelayMessage::Hello { peer: HOST }, Instant::now());
        assert_eq!(out, vec![(addr(1), RelayMessage::Welcome { peer: HOST })]);
        assert_eq!(relay.metrics().registered_peers.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unregistered_rejected() {
        let mut relay = Relay::new(Duration::from_secs(10));
        let out = relay.handle(
            addr(9),
            RelayMessage::JoinLobby { lobby: SessionId(1) },
            Instant::now(),
        );
        assert!(matches!(
            out[0].1,
            RelayMessage::Error { code: RelayError::NotRegistered, .. }
        ));
    }

    #[test]
    fn test_join_broadcasts_update() {
        let mut relay = relay_with_peers();
        let lobby = create_lobby(&mut relay);

        let out = relay.handle(addr(2), RelayMessage::JoinLobby { lobby }, Instant::now());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, addr(1));
        assert!(matches!(out[0].1, RelayMessage::LobbyUpdated { .. }));
        assert_eq!(
            out[1],
            (
                addr(2),
                RelayMessage::LobbyEntered {
                    lobby,
                    owner: HOST,
                    members: vec![HOST, CLIENT],
                }
            )
        );
    }

    #[test]
    fn test_join_missing_lobby() {
        let mut relay = relay_with_peers();
        let out = relay.handle(
            addr(2),
            RelayMessage::JoinLobby { lobby: SessionId(7) },
            Instant::now(),
        );
        assert_eq!(
            out,
            vec![(
                addr(2),
                RelayMessage::LobbyEnterFailed {
                    lobby: Some(SessionId(7)),
                    code: RelayError::LobbyNotFound,
                }
            )]
        );
    }

    #[test]
    fn test_probe_held_until_accepted() {
        let mut relay = relay_with_peers();
        let now = Instant::now();

        let out = relay.handle(
            addr(2),
            RelayMessage::Datagram { peer: HOST, payload: vec![] },
            now,
        );
        assert_eq!(out, vec![(addr(1), RelayMessage::SessionRequest { peer: CLIENT })]);

        let out = relay.handle(addr(1), RelayMessage::AcceptSession { peer: CLIENT }, now);
        assert_eq!(
            out,
            vec![(addr(1), RelayMessage::Datagram { peer: CLIENT, payload: vec![] })]
        );

        // Client accepted the host implicitly by sending to it
        let out = relay.handle(
            addr(1),
            RelayMessage::Datagram { peer: CLIENT, payload: vec![] },
            now,
        );
        assert_eq!(
            out,
            vec![(addr(2), RelayMessage::Datagram { peer: HOST, payload: vec![] })]
        );
    }

    #[test]
    fn test_unknown_destination() {
        let mut relay = relay_with_peers();
        let out = relay.handle(
            addr(2),
            RelayMessage::Datagram { peer: PeerIdentity(999), payload: vec![1] },
            Instant::now(),
        );
        assert_eq!(
            out,
            vec![(
                addr(2),
                RelayMessage::SendFailed {
                    peer: PeerIdentity(999),
                    code: RelayError::PeerUnreachable,
                }
            )]
        );
    }

    #[test]
    fn test_owner_leave_updates_members() {
        let mut relay = relay_with_peers();
        let lobby = create_lobby(&mut relay);
        relay.handle(addr(2), RelayMessage::JoinLobby { lobby }, Instant::now());

        let out = relay.handle(addr(1), RelayMessage::LeaveLobby { lobby }, Instant::now());
        assert_eq!(
            out,
            vec![(
                addr(2),
                RelayMessage::LobbyUpdated {
                    lobby,
                    owner: CLIENT,
                    members: vec![CLIENT],
                }
            )]
        );
    }

    #[test]
    fn test_server_only_message_rejected() {
        let mut relay = relay_with_peers();
        let out = relay.handle(
            addr(1),
            RelayMessage::SessionRequest { peer: CLIENT },
            Instant::now(),
        );
        assert!(matches!(
            out[0].1,
            RelayMessage::Error { code: RelayError::InvalidMessage, .. }
        ));
    }

    #[test]
    fn test_expired_request_reports_send_failure() {
        let mut relay = relay_with_peers();
        let now = Instant::now();
        relay.handle(
            addr(2),
            RelayMessage::Datagram { peer: HOST, payload: vec![] },
            now,
        );

        let out = relay.expire(now + Duration::from_secs(11));
        assert_eq!(
            out,
            vec![(
                addr(2),
                RelayMessage::SendFailed {
                    peer: HOST,
                    code: RelayError::PeerUnreachable,
                }
            )]
        );
    }
}
