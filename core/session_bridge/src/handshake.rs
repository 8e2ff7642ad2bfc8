//! Session lifecycle and peer handshake
//!
//! [`HandshakeStateMachine`] turns directory completions, relay session
//! requests and engine control messages into [`SessionConnectionState`]
//! transitions. Every wait is an explicit [`HandshakePhase`] with a deadline,
//! advanced once per tick; nothing blocks and nothing spins.
//!
//! # State Edges
//!
//! ```text
//! UNDEFINED/CANCELLED/FAILED/DISCONNECTED ──join/create──► CONNECTING
//! CONNECTING ──entered──► CONNECTED
//! CONNECTING ──platform error/refused/timeout──► FAILED
//! CONNECTING ──cancel──► CANCELLED
//! CONNECTED  ──handshake timeout/rejection──► FAILED
//! any ──disconnect──► DISCONNECTING ──► DISCONNECTED
//! ```
//!
//! # Host Path
//!
//! start server → local connection → AwaitingServerActive → invite prompt →
//! Hosting. Each member's session request is accepted, confirmed with an
//! empty datagram and registered with the engine.
//!
//! # Client Path
//!
//! empty datagram to owner → AwaitingFirstDatagram → engine connect →
//! AwaitingTransportConnect → spawn request → Established.

use std::fmt;
use std::time::{Duration, Instant};

use crate::adapter::drain_outbound;
use crate::channel::PeerChannel;
use crate::config::BridgeConfig;
use crate::directory::SessionDirectory;
use crate::error::BridgeError;
use crate::events::PlatformEvent;
use crate::identity::{PeerIdentity, SessionId};
use crate::protocol::SpawnRequest;
use crate::registry::{ConnectionRegistry, PeerConnection};
use crate::transport::{
    ConnectionId, ReliableTransport, TransportEvent, MSG_CONNECT, MSG_SPAWN_REQUEST,
};

// ============================================================================
// States
// ============================================================================

/// Externally observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConnectionState {
    Undefined,
    Connecting,
    Cancelled,
    Connected,
    Failed,
    Disconnecting,
    Disconnected,
}

impl SessionConnectionState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionConnectionState) -> bool {
        use SessionConnectionState::*;
        match (self, next) {
            (_, Disconnecting) => true,
            (Disconnecting, Disconnected) => true,
            (Undefined | Cancelled | Failed | Disconnected, Connecting) => true,
            (Connecting, Connected | Failed | Cancelled) => true,
            (Connected, Failed) => true,
            _ => false,
        }
    }

    /// States from which a new join or create may start
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            SessionConnectionState::Undefined
                | SessionConnectionState::Cancelled
                | SessionConnectionState::Failed
                | SessionConnectionState::Disconnected
        )
    }
}

impl fmt::Display for SessionConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionConnectionState::Undefined => "UNDEFINED",
            SessionConnectionState::Connecting => "CONNECTING",
            SessionConnectionState::Cancelled => "CANCELLED",
            SessionConnectionState::Connected => "CONNECTED",
            SessionConnectionState::Failed => "FAILED",
            SessionConnectionState::Disconnecting => "DISCONNECTING",
            SessionConnectionState::Disconnected => "DISCONNECTED",
        };
        write!(f, "{}", name)
    }
}

/// Role derived from lobby ownership once connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Internal handshake sub-state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    /// Join (`target` set) or create (`target` None) requested
    AwaitingSessionEntered {
        target: Option<SessionId>,
        deadline: Instant,
    },
    AwaitingServerActive {
        deadline: Instant,
    },
    /// Host accepting member session requests
    Hosting,
    AwaitingFirstDatagram {
        host: PeerIdentity,
        deadline: Instant,
    },
    AwaitingTransportConnect {
        conn: ConnectionId,
        deadline: Instant,
    },
    /// Client connected and spawn requested
    Established,
}

// ============================================================================
// Platform Context
// ============================================================================

/// Collaborators a transition may touch
///
/// Passed into every transition instead of living in globals.
pub struct Platform<'a> {
    pub directory: &'a mut dyn SessionDirectory,
    pub channel: &'a mut dyn PeerChannel,
    pub engine: &'a mut dyn ReliableTransport,
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug)]
pub struct HandshakeStateMachine {
    config: BridgeConfig,
    state: SessionConnectionState,
    phase: HandshakePhase,
    role: Option<Role>,
    session: Option<SessionId>,
    local: Option<PeerIdentity>,
    join_friend_triggered: bool,
    p2p_established: bool,
    registry: ConnectionRegistry,
    spawn_drops: u64,
    handshakes_completed: u64,
}

impl HandshakeStateMachine {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: SessionConnectionState::Undefined,
            phase: HandshakePhase::Idle,
            role: None,
            session: None,
            local: None,
            join_friend_triggered: false,
            p2p_established: false,
            registry: ConnectionRegistry::new(),
            spawn_drops: 0,
            handshakes_completed: 0,
        }
    }

    pub fn state(&self) -> SessionConnectionState {
        self.state
    }

    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn join_friend_triggered(&self) -> bool {
        self.join_friend_triggered
    }

    /// Gate for the transport adapter pump
    pub fn p2p_established(&self) -> bool {
        self.p2p_established
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Spawn requests dropped for want of a registered connection
    pub fn spawn_drops(&self) -> u64 {
        self.spawn_drops
    }

    pub fn handshakes_completed(&self) -> u64 {
        self.handshakes_completed
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn set_state(&mut self, next: SessionConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            log::warn!("Rejected session state transition {} -> {}", self.state, next);
            return;
        }
        log::info!("Session state {} -> {}", self.state, next);
        self.state = next;
    }

    fn deadline(&self, now: Instant, timeout: Duration) -> Instant {
        now + timeout
    }

    // ========================================================================
    // Lifecycle Operations
    // ========================================================================

    /// Create a lobby owned by us
    pub fn create_session(&mut self, p: &mut Platform<'_>, now: Instant) {
        if !self.begin_connecting() {
            return;
        }
        if !p.directory.is_ready() {
            self.fail(p, BridgeError::PlatformUnavailable);
            return;
        }
        if let Err(e) = p
            .directory
            .create_session(self.config.visibility, self.config.max_members)
        {
            self.fail(p, e);
            return;
        }
        log::info!(
            "Creating {:?} lobby for {} members",
            self.config.visibility,
            self.config.max_members
        );
        self.phase = HandshakePhase::AwaitingSessionEntered {
            target: None,
            deadline: self.deadline(now, self.config.handshake_timeout()),
        };
    }

    /// Join an existing lobby
    pub fn join_session(&mut self, id: SessionId, p: &mut Platform<'_>, now: Instant) {
        if !self.begin_connecting() {
            return;
        }
        if !p.directory.is_ready() {
            self.fail(p, BridgeError::PlatformUnavailable);
            return;
        }
        if let Err(e) = p.directory.join_session(id) {
            self.fail(p, e);
            return;
        }
        log::info!("Joining lobby {}", id);
        self.phase = HandshakePhase::AwaitingSessionEntered {
            target: Some(id),
            deadline: self.deadline(now, self.config.handshake_timeout()),
        };
    }

    fn begin_connecting(&mut self) -> bool {
        if !self.state.is_idle() {
            log::warn!("Session already {}, ignoring join/create", self.state);
            return false;
        }
        self.set_state(SessionConnectionState::Connecting);
        true
    }

    /// Join a lobby from an out-of-band invite, leaving any current one first
    pub fn accept_invite(&mut self, id: SessionId, p: &mut Platform<'_>, now: Instant) {
        log::info!("Invite accepted for lobby {}", id);
        match self.state {
            SessionConnectionState::Connected => self.disconnect(p),
            SessionConnectionState::Connecting => self.cancel(p),
            _ => {}
        }
        self.join_friend_triggered = true;
        self.join_session(id, p, now);
    }

    /// Abort a join/create that has not connected yet
    pub fn cancel(&mut self, p: &mut Platform<'_>) {
        if self.state != SessionConnectionState::Connecting {
            log::debug!("Nothing to cancel in state {}", self.state);
            return;
        }
        self.teardown(p);
        self.set_state(SessionConnectionState::Cancelled);
    }

    /// Tear everything down; safe from any state and idempotent
    pub fn disconnect(&mut self, p: &mut Platform<'_>) {
        self.set_state(SessionConnectionState::Disconnecting);
        self.teardown(p);
        self.set_state(SessionConnectionState::Disconnected);
    }

    fn fail(&mut self, p: &mut Platform<'_>, error: BridgeError) {
        log::warn!("Session failed in state {}: {}", self.state, error);
        self.teardown(p);
        self.set_state(SessionConnectionState::Failed);
    }

    fn teardown(&mut self, p: &mut Platform<'_>) {
        p.engine.shutdown();
        let (_, failed) = drain_outbound(&mut *p.channel, &mut *p.engine);
        if !failed.is_empty() {
            log::debug!("{} goodbye frame(s) not delivered", failed.len());
        }

        for peer in self.registry.remote_peers() {
            p.channel.close_session(peer);
        }
        if let HandshakePhase::AwaitingFirstDatagram { host, .. } = self.phase {
            p.channel.close_session(host);
        }
        if let Some(id) = self.session.take() {
            log::info!("Leaving lobby {}", id);
            p.directory.leave_session(id);
        }

        self.registry.clear();
        self.p2p_established = false;
        self.phase = HandshakePhase::Idle;
        self.role = None;
        self.local = None;
        self.join_friend_triggered = false;
    }

    // ========================================================================
    // Platform Events
    // ========================================================================

    pub fn handle_event(&mut self, event: PlatformEvent, p: &mut Platform<'_>, now: Instant) {
        match event {
            PlatformEvent::SessionEntered(id) => self.on_session_entered(id, p, now),
            PlatformEvent::SessionEnterFailed { session, reason } => {
                self.on_session_enter_failed(session, reason, p)
            }
            PlatformEvent::InviteAccepted(id) => self.accept_invite(id, p, now),
            PlatformEvent::PeerSessionRequested(peer) => self.on_peer_session_request(peer, p),
        }
    }

    fn on_session_entered(&mut self, id: SessionId, p: &mut Platform<'_>, now: Instant) {
        let awaited = match self.phase {
            HandshakePhase::AwaitingSessionEntered { target, .. } => {
                target.map(|t| t == id).unwrap_or(true)
            }
            _ => false,
        };
        if !awaited {
            log::debug!("Stale entry into lobby {}, leaving it", id);
            p.directory.leave_session(id);
            return;
        }

        log::info!("Entered lobby {}", id);
        self.session = Some(id);
        self.set_state(SessionConnectionState::Connected);

        let (role, owner) = match self.assign_role(id, p) {
            Ok(assigned) => assigned,
            Err(e) => {
                self.fail(p, e);
                return;
            }
        };

        let result = match role {
            Role::Host => self.start_host(p, now),
            Role::Client => self.start_client(owner, p, now),
        };
        if let Err(e) = result {
            self.fail(p, e);
        }
    }

    fn assign_role(
        &mut self,
        id: SessionId,
        p: &mut Platform<'_>,
    ) -> Result<(Role, PeerIdentity), BridgeError> {
        let local = p.directory.local_identity()?;
        let owner = p.directory.owner(id)?;
        let role = if local == owner { Role::Host } else { Role::Client };

        log::info!("Peer {} is {:?} of lobby {} (owner {})", local, role, id, owner);
        self.local = Some(local);
        self.role = Some(role);
        self.join_friend_triggered = false;
        Ok((role, owner))
    }

    fn on_session_enter_failed(
        &mut self,
        session: Option<SessionId>,
        reason: String,
        p: &mut Platform<'_>,
    ) {
        let awaited = match self.phase {
            HandshakePhase::AwaitingSessionEntered { target, .. } => {
                match (target, session) {
                    (Some(t), Some(s)) => t == s,
                    _ => true,
                }
            }
            _ => false,
        };
        if !awaited {
            log::debug!("Ignoring stale lobby failure: {}", reason);
            return;
        }
        self.fail(p, BridgeError::Transport(format!("lobby entry refused: {}", reason)));
    }

    // ========================================================================
    // Host Path
    // ========================================================================

    fn start_host(&mut self, p: &mut Platform<'_>, now: Instant) -> Result<(), BridgeError> {
        let local = self.local.ok_or(BridgeError::PlatformUnavailable)?;

        p.engine.start_server(&self.config.topology)?;
        p.engine.register_handler(MSG_SPAWN_REQUEST);

        let conn = p.engine.connect_local()?;
        self.registry.insert(PeerConnection::local(local, conn));
        p.engine.set_ready(conn)?;
        p.engine.spawn_player(conn)?;

        self.phase = HandshakePhase::AwaitingServerActive {
            deadline: self.deadline(now, self.config.server_start_timeout()),
        };
        Ok(())
    }

    fn on_peer_session_request(&mut self, peer: PeerIdentity, p: &mut Platform<'_>) {
        if self.role != Some(Role::Host) {
            log::debug!("Session request from {} while not hosting, ignoring", peer);
            return;
        }
        if let Err(e) = self.authorize(peer, p) {
            log::warn!("Ignoring session request: {}", e);
            return;
        }

        p.channel.accept_session(peer);
        if let Err(e) = p.channel.send(peer, &[]) {
            log::warn!("Confirmation to {} failed: {}", peer, e);
            p.channel.close_session(peer);
            return;
        }
        log::info!("Accepted session with peer {}", peer);

        let conn = match p.engine.add_peer(peer) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Engine refused peer {}: {}", peer, e);
                p.channel.close_session(peer);
                return;
            }
        };
        if let Some(old) = self.registry.insert(PeerConnection::remote(peer, conn)) {
            p.engine.remove_peer(old.conn);
        }
        self.p2p_established = true;
        self.handshakes_completed += 1;
    }

    /// Only current members other than ourselves may open a session
    fn authorize(&self, peer: PeerIdentity, p: &mut Platform<'_>) -> Result<(), BridgeError> {
        let session = self.session.ok_or(BridgeError::UnauthorizedPeer(peer))?;
        if Some(peer) == self.local {
            return Err(BridgeError::UnauthorizedPeer(peer));
        }
        let members = p.directory.members(session)?;
        if members.contains(&peer) {
            Ok(())
        } else {
            Err(BridgeError::UnauthorizedPeer(peer))
        }
    }

    fn handle_spawn_request(&mut self, payload: &[u8], p: &mut Platform<'_>) {
        let request = match SpawnRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                self.spawn_drops += 1;
                log::warn!("Dropping malformed spawn request: {}", e);
                return;
            }
        };

        let conn = match self.registry.lookup(request.peer) {
            Some(connection) => connection.conn,
            None => {
                self.spawn_drops += 1;
                log::warn!(
                    "Dropping spawn request: {}",
                    BridgeError::SpawnTargetMissing(request.peer)
                );
                return;
            }
        };

        let spawned = p
            .engine
            .set_ready(conn)
            .and_then(|_| p.engine.spawn_player(conn));
        match spawned {
            Ok(entity) => log::info!("Spawned {:?} for peer {}", entity, request.peer),
            Err(e) => log::warn!("Spawn for peer {} failed: {}", request.peer, e),
        }
    }

    // ========================================================================
    // Client Path
    // ========================================================================

    fn start_client(
        &mut self,
        host: PeerIdentity,
        p: &mut Platform<'_>,
        now: Instant,
    ) -> Result<(), BridgeError> {
        // An empty datagram to an unestablished peer is the session request
        p.channel.send(host, &[])?;
        log::info!("Sent session probe to host {}", host);

        self.phase = HandshakePhase::AwaitingFirstDatagram {
            host,
            deadline: self.deadline(now, self.config.handshake_timeout()),
        };
        Ok(())
    }

    /// Drain datagrams until one arrives from `host`
    ///
    /// Returns true when the host's confirmation was consumed.
    fn poll_host_confirmation(
        &mut self,
        host: PeerIdentity,
        p: &mut Platform<'_>,
    ) -> Result<bool, BridgeError> {
        while let Some(size) = p.channel.poll_available() {
            let mut buf = vec![0u8; size.max(1)];
            let (_, sender) = p.channel.receive(&mut buf)?;
            if sender == host {
                return Ok(true);
            }
            log::debug!("Discarding datagram from {} while awaiting host {}", sender, host);
        }
        Ok(false)
    }

    fn connect_to_host(
        &mut self,
        host: PeerIdentity,
        p: &mut Platform<'_>,
        now: Instant,
    ) -> Result<(), BridgeError> {
        if !p.channel.session_state(host).is_established() {
            return Err(BridgeError::Transport(format!(
                "no established relay session with host {}",
                host
            )));
        }
        log::info!("Host {} confirmed the session", host);
        self.p2p_established = true;

        p.engine.register_handler(MSG_CONNECT);
        let conn = p.engine.connect_client(host, &self.config.topology)?;
        self.registry.insert(PeerConnection::remote(host, conn));

        self.phase = HandshakePhase::AwaitingTransportConnect {
            conn,
            deadline: self.deadline(now, self.config.handshake_timeout()),
        };
        Ok(())
    }

    fn on_transport_connected(&mut self, conn: ConnectionId, p: &mut Platform<'_>) {
        match self.phase {
            HandshakePhase::AwaitingTransportConnect { conn: expected, .. } if expected == conn => {}
            _ => {
                log::debug!("Ignoring connect on {}", conn);
                return;
            }
        }
        p.engine.unregister_handler(MSG_CONNECT);

        let local = match self.local {
            Some(local) => local,
            None => return,
        };
        let sent = SpawnRequest { peer: local }
            .encode()
            .map_err(BridgeError::from)
            .and_then(|payload| p.engine.send(conn, MSG_SPAWN_REQUEST, &payload));
        if let Err(e) = sent {
            self.fail(p, e);
            return;
        }

        log::info!("Connected to host on {}, spawn requested for {}", conn, local);
        self.phase = HandshakePhase::Established;
        self.handshakes_completed += 1;
    }

    // ========================================================================
    // Per-Tick Progress
    // ========================================================================

    /// Advance the current sub-state; called once per tick after engine update
    pub fn advance(&mut self, p: &mut Platform<'_>, now: Instant) {
        match self.phase {
            HandshakePhase::AwaitingSessionEntered { deadline, .. } => {
                if now >= deadline {
                    self.fail(p, BridgeError::HandshakeTimeout);
                }
            }
            HandshakePhase::AwaitingServerActive { deadline } => {
                if p.engine.is_server_active() {
                    if let Some(id) = self.session {
                        p.directory.show_invite_dialog(id);
                    }
                    log::info!("Hosting lobby {:?}", self.session);
                    self.phase = HandshakePhase::Hosting;
                } else if now >= deadline {
                    self.fail(p, BridgeError::HandshakeTimeout);
                }
            }
            HandshakePhase::AwaitingFirstDatagram { host, deadline } => {
                let outcome = self
                    .poll_host_confirmation(host, p)
                    .and_then(|confirmed| {
                        if confirmed {
                            self.connect_to_host(host, p, now).map(|_| true)
                        } else {
                            Ok(false)
                        }
                    });
                match outcome {
                    Ok(true) => {}
                    Ok(false) if now >= deadline => self.fail(p, BridgeError::HandshakeTimeout),
                    Ok(false) => {}
                    Err(e) => self.fail(p, e),
                }
            }
            HandshakePhase::AwaitingTransportConnect { deadline, .. } => {
                if now >= deadline {
                    self.fail(p, BridgeError::HandshakeTimeout);
                }
            }
            HandshakePhase::Idle | HandshakePhase::Hosting | HandshakePhase::Established => {}
        }
    }

    /// Consume one engine event
    pub fn handle_transport_event(&mut self, event: TransportEvent, p: &mut Platform<'_>) {
        match event {
            TransportEvent::Message {
                conn,
                msg_type: MSG_CONNECT,
                ..
            } => self.on_transport_connected(conn, p),
            TransportEvent::Message {
                msg_type: MSG_SPAWN_REQUEST,
                payload,
                ..
            } => {
                if self.role == Some(Role::Host) {
                    self.handle_spawn_request(&payload, p);
                } else {
                    log::debug!("Ignoring spawn request while not hosting");
                }
            }
            TransportEvent::Message { conn, msg_type, .. } => {
                log::debug!("Unhandled message type {} on {}", msg_type, conn);
            }
            TransportEvent::Disconnected { conn } => self.on_transport_disconnected(conn, p),
        }
    }

    fn on_transport_disconnected(&mut self, conn: ConnectionId, p: &mut Platform<'_>) {
        let peer = match self.registry.peer_for_connection(conn) {
            Some(peer) => peer,
            None => return,
        };
        log::info!("Peer {} disconnected", peer);

        if self.role == Some(Role::Client) {
            self.disconnect(p);
            return;
        }
        self.registry.remove(peer);
        p.channel.close_session(peer);
    }

    /// Drop peers whose relay traffic failed
    pub fn remove_failed_peers(&mut self, peers: &[PeerIdentity], p: &mut Platform<'_>) {
        for &peer in peers {
            let removed = match self.registry.lookup(peer) {
                Some(connection) if connection.is_remote() => self.registry.remove(peer),
                _ => None,
            };
            let connection = match removed {
                Some(connection) => connection,
                None => continue,
            };
            log::warn!("Removing failed connection {} for peer {}", connection.conn, peer);

            if self.role == Some(Role::Client) {
                self.fail(p, BridgeError::Transport(format!("lost relay session with {}", peer)));
                return;
            }
            p.engine.remove_peer(connection.conn);
            p.channel.close_session(peer);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
