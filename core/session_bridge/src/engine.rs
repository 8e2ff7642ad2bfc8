//! Minimal sequenced message engine
//!
//! Implements [`ReliableTransport`] on top of whatever datagram path the
//! bridge provides. It frames typed messages, performs a connect exchange,
//! and drops stale frames per connection (sequenced delivery). It does not
//! retransmit: the relay's own delivery guarantee is relied upon.
//!
//! # Connect Exchange
//!
//! ```text
//! Client                         Server
//!   │── ConnectRequest ────────────►│  (server marks connection connected)
//!   │◄─────────── ConnectAccept ────│
//!   │  MSG_CONNECT raised           │
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::codec::{decode_message, encode_message};
use crate::error::BridgeError;
use crate::identity::PeerIdentity;
use crate::protocol::MAX_PEER_FRAME_SIZE;
use crate::transport::{
    ConnectionId, EntityId, MessageType, ReliableTransport, Topology, TransportEvent, MSG_CONNECT,
};

// ============================================================================
// Frames
// ============================================================================

/// Engine frame carried inside one relay datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineFrame {
    ConnectRequest,
    ConnectAccept,
    Message {
        channel: u8,
        sequence: u32,
        msg_type: MessageType,
        payload: Vec<u8>,
    },
    Disconnect,
}

// ============================================================================
// Engine State
// ============================================================================

/// What the engine is currently running as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Idle,
    /// Server started, becomes active on the next update
    ServerStarting,
    ServerActive,
    Client,
}

#[derive(Debug)]
struct EngineConnection {
    /// None for the host's in-process connection
    peer: Option<PeerIdentity>,
    connected: bool,
    ready: bool,
    send_sequence: u32,
    last_received: Option<u32>,
}

impl EngineConnection {
    fn new(peer: Option<PeerIdentity>, connected: bool) -> Self {
        Self {
            peer,
            connected,
            ready: false,
            send_sequence: 0,
            last_received: None,
        }
    }
}

/// A player entity and the connection holding authority over it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedPlayer {
    pub entity: EntityId,
    pub owner: ConnectionId,
}

/// Sequenced message engine
#[derive(Debug)]
pub struct SequencedEngine {
    mode: EngineMode,
    topology: Topology,
    connections: HashMap<ConnectionId, EngineConnection>,
    next_conn: u32,
    handlers: HashSet<MessageType>,
    outbound: VecDeque<(PeerIdentity, Vec<u8>)>,
    events: VecDeque<TransportEvent>,
    spawned: Vec<SpawnedPlayer>,
    next_entity: u64,
}

impl SequencedEngine {
    pub fn new() -> Self {
        Self {
            mode: EngineMode::Idle,
            topology: Topology::default(),
            connections: HashMap::new(),
            next_conn: 0,
            handlers: HashSet::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            spawned: Vec::new(),
            next_entity: 1,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    /// Players spawned so far (for inspection)
    pub fn spawned(&self) -> &[SpawnedPlayer] {
        &self.spawned
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_ready(&self, conn: ConnectionId) -> bool {
        self.connections.get(&conn).map(|c| c.ready).unwrap_or(false)
    }

    fn is_server(&self) -> bool {
        matches!(self.mode, EngineMode::ServerStarting | EngineMode::ServerActive)
    }

    fn allocate(&mut self, peer: Option<PeerIdentity>, connected: bool) -> ConnectionId {
        let conn = ConnectionId(self.next_conn);
        self.next_conn = self.next_conn.wrapping_add(1);
        self.connections.insert(conn, EngineConnection::new(peer, connected));
        conn
    }

    fn queue_frame(&mut self, peer: PeerIdentity, frame: &EngineFrame) -> Result<(), BridgeError> {
        let bytes = encode_message(frame)?;
        if bytes.len() > MAX_PEER_FRAME_SIZE {
            return Err(BridgeError::FrameTooLarge(bytes.len()));
        }
        self.outbound.push_back((peer, bytes));
        Ok(())
    }

    fn deliver(&mut self, conn: ConnectionId, msg_type: MessageType, payload: Vec<u8>) {
        if self.handlers.contains(&msg_type) {
            self.events.push_back(TransportEvent::Message {
                conn,
                msg_type,
                payload,
            });
        } else {
            log::debug!("No handler for message type {} on {}, dropping", msg_type, conn);
        }
    }
}

impl Default for SequencedEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// ReliableTransport
// ============================================================================

impl ReliableTransport for SequencedEngine {
    fn start_server(&mut self, topology: &Topology) -> Result<(), BridgeError> {
        if self.is_server() {
            log::debug!("Engine server already started");
            return Ok(());
        }
        log::info!(
            "Starting engine server ({} channel(s), {} connections)",
            topology.channels.len(),
            topology.max_connections
        );
        self.topology = topology.clone();
        self.mode = EngineMode::ServerStarting;
        Ok(())
    }

    fn is_server_active(&self) -> bool {
        self.mode == EngineMode::ServerActive
    }

    fn update(&mut self) {
        if self.mode == EngineMode::ServerStarting {
            self.mode = EngineMode::ServerActive;
            log::info!("Engine server active");
        }
    }

    fn connect_local(&mut self) -> Result<ConnectionId, BridgeError> {
        if !self.is_server() {
            return Err(BridgeError::Transport("engine server not started".to_string()));
        }
        let conn = self.allocate(None, true);
        log::debug!("Local connection {} created", conn);
        Ok(conn)
    }

    fn add_peer(&mut self, peer: PeerIdentity) -> Result<ConnectionId, BridgeError> {
        if !self.is_server() {
            return Err(BridgeError::Transport("engine server not started".to_string()));
        }
        // A connection to the same peer is about to be replaced
        let in_use = self
            .connections
            .values()
            .filter(|c| c.peer != Some(peer))
            .count();
        if in_use >= self.topology.max_connections {
            return Err(BridgeError::Transport(format!(
                "engine at capacity ({} connections)",
                self.topology.max_connections
            )));
        }
        let conn = self.allocate(Some(peer), false);
        log::info!("External connection {} added for peer {}", conn, peer);
        Ok(conn)
    }

    fn remove_peer(&mut self, conn: ConnectionId) {
        if let Some(connection) = self.connections.remove(&conn) {
            // A peer that reconnected keeps its newer connection
            let superseded = self.connections.values().any(|c| c.peer == connection.peer);
            if let (Some(peer), true, false) = (connection.peer, connection.connected, superseded) {
                if let Err(e) = self.queue_frame(peer, &EngineFrame::Disconnect) {
                    log::debug!("Failed to queue disconnect for {}: {}", peer, e);
                }
            }
            log::info!("Connection {} removed", conn);
        }
    }

    fn connect_client(
        &mut self,
        host: PeerIdentity,
        topology: &Topology,
    ) -> Result<ConnectionId, BridgeError> {
        self.topology = topology.clone();
        self.mode = EngineMode::Client;
        let conn = self.allocate(Some(host), false);
        self.queue_frame(host, &EngineFrame::ConnectRequest)?;
        log::info!("Client connection {} connecting to host {}", conn, host);
        Ok(conn)
    }

    fn ingest(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<(), BridgeError> {
        if bytes.is_empty() {
            log::trace!("Ignoring empty datagram on {}", conn);
            return Ok(());
        }

        let (frame, _) = decode_message::<EngineFrame>(bytes)?;
        let is_server = self.is_server();
        let is_client = self.mode == EngineMode::Client;
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(BridgeError::UnknownConnection(conn))?;

        match frame {
            EngineFrame::ConnectRequest => {
                let peer = match (is_server, connection.peer) {
                    (true, Some(peer)) => peer,
                    _ => {
                        log::debug!("Unexpected ConnectRequest on {}", conn);
                        return Ok(());
                    }
                };
                let first = !connection.connected;
                connection.connected = true;
                // Re-acknowledge duplicates in case our accept was lost
                self.queue_frame(peer, &EngineFrame::ConnectAccept)?;
                if first {
                    log::info!("Peer {} connected on {}", peer, conn);
                    self.deliver(conn, MSG_CONNECT, Vec::new());
                }
            }
            EngineFrame::ConnectAccept => {
                if !is_client {
                    log::debug!("Unexpected ConnectAccept on {}", conn);
                    return Ok(());
                }
                if !connection.connected {
                    connection.connected = true;
                    log::info!("Connected to host on {}", conn);
                    self.deliver(conn, MSG_CONNECT, Vec::new());
                }
            }
            EngineFrame::Message {
                channel,
                sequence,
                msg_type,
                payload,
            } => {
                if !self.topology.has_channel(channel) {
                    return Err(BridgeError::InvalidChannel(channel));
                }
                if !connection.connected {
                    log::debug!("Message on unconnected {}, dropping", conn);
                    return Ok(());
                }
                if let Some(last) = connection.last_received {
                    if sequence <= last {
                        log::trace!("Stale sequence {} (last {}) on {}", sequence, last, conn);
                        return Ok(());
                    }
                }
                connection.last_received = Some(sequence);
                self.deliver(conn, msg_type, payload);
            }
            EngineFrame::Disconnect => {
                self.connections.remove(&conn);
                log::info!("Connection {} closed by remote", conn);
                self.events.push_back(TransportEvent::Disconnected { conn });
            }
        }

        Ok(())
    }

    fn poll_outbound(&mut self) -> Option<(PeerIdentity, Vec<u8>)> {
        self.outbound.pop_front()
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn register_handler(&mut self, msg_type: MessageType) {
        self.handlers.insert(msg_type);
    }

    fn unregister_handler(&mut self, msg_type: MessageType) {
        self.handlers.remove(&msg_type);
    }

    fn send(
        &mut self,
        conn: ConnectionId,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(), BridgeError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(BridgeError::UnknownConnection(conn))?;
        if !connection.connected {
            return Err(BridgeError::NotConnected(conn));
        }

        match connection.peer {
            None => {
                self.deliver(conn, msg_type, payload.to_vec());
                Ok(())
            }
            Some(peer) => {
                let sequence = connection.send_sequence;
                connection.send_sequence = connection.send_sequence.wrapping_add(1);
                let frame = EngineFrame::Message {
                    channel: 0,
                    sequence,
                    msg_type,
                    payload: payload.to_vec(),
                };
                self.queue_frame(peer, &frame)
            }
        }
    }

    fn set_ready(&mut self, conn: ConnectionId) -> Result<(), BridgeError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(BridgeError::UnknownConnection(conn))?;
        connection.ready = true;
        log::debug!("Connection {} ready", conn);
        Ok(())
    }

    fn spawn_player(&mut self, conn: ConnectionId) -> Result<EntityId, BridgeError> {
        let connection = self
            .connections
            .get(&conn)
            .ok_or(BridgeError::UnknownConnection(conn))?;
        if !connection.ready {
            return Err(BridgeError::NotConnected(conn));
        }

        let entity = EntityId(self.next_entity);
        self.next_entity += 1;
        self.spawned.push(SpawnedPlayer { entity, owner: conn });
        log::info!("Spawned player {:?} with authority on {}", entity, conn);
        Ok(entity)
    }

    fn is_connected(&self, conn: ConnectionId) -> bool {
        self.connections.get(&conn).map(|c| c.connected).unwrap_or(false)
    }

    fn shutdown(&mut self) {
        if self.mode == EngineMode::Idle && self.connections.is_empty() {
            return;
        }

        let remote: Vec<PeerIdentity> = self
            .connections
            .values()
            .filter(|c| c.connected)
            .filter_map(|c| c.peer)
            .collect();
        for peer in remote {
            if let Err(e) = self.queue_frame(peer, &EngineFrame::Disconnect) {
                log::debug!("Failed to queue disconnect for {}: {}", peer, e);
            }
        }

        log::info!("Engine shut down ({} connections)", self.connections.len());
        self.connections.clear();
        self.handlers.clear();
        self.events.clear();
        self.spawned.clear();
        self.mode = EngineMode::Idle;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: PeerIdentity = PeerIdentity(100);
    const CLIENT: PeerIdentity = PeerIdentity(200);

    /// Move every queued frame from `from` into connection `conn` of `to`
    fn pump(from: &mut SequencedEngine, to: &mut SequencedEngine, conn: ConnectionId) {
        while let Some((_, bytes)) = from.poll_outbound() {
            to.ingest(conn, &bytes).unwrap();
        }
    }

    /// Server with an external connection for CLIENT, and a client connected to it
    fn connected_pair() -> (SequencedEngine, ConnectionId, SequencedEngine, ConnectionId) {
        let mut server = SequencedEngine::new();
        server.start_server(&Topology::default()).unwrap();
        server.update();
        let server_conn = server.add_peer(CLIENT).unwrap();

        let mut client = SequencedEngine::new();
        client.register_handler(MSG_CONNECT);
        let client_conn = client.connect_client(HOST, &Topology::default()).unwrap();

        pump(&mut client, &mut server, server_conn);
        pump(&mut server, &mut client, client_conn);
        (server, server_conn, client, client_conn)
    }

    #[test]
    fn test_server_becomes_active_after_update() {
        let mut engine = SequencedEngine::new();
        engine.start_server(&Topology::default()).unwrap();
        assert!(!engine.is_server_active());
        assert_eq!(engine.mode(), EngineMode::ServerStarting);

        engine.update();
        assert!(engine.is_server_active());
    }

    #[test]
    fn test_add_peer_requires_server() {
        let mut engine = SequencedEngine::new();
        assert!(engine.add_peer(CLIENT).is_err());
        assert!(engine.connect_local().is_err());
    }

    #[test]
    fn test_add_peer_respects_capacity() {
        let mut engine = SequencedEngine::new();
        engine.start_server(&Topology::default()).unwrap();
        engine.connect_local().unwrap();
        engine.add_peer(CLIENT).unwrap();

        // Replacing the same peer does not need a free slot
        engine.add_peer(CLIENT).unwrap();
        assert!(matches!(
            engine.add_peer(PeerIdentity(300)),
            Err(BridgeError::Transport(_))
        ));
        assert_eq!(engine.connection_count(), 3);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let (_, _, mut client, client_conn) = connected_pair();
        while client.poll_outbound().is_some() {}

        let payload = vec![0u8; MAX_PEER_FRAME_SIZE];
        assert!(matches!(
            client.send(client_conn, 7, &payload),
            Err(BridgeError::FrameTooLarge(_))
        ));
        assert!(client.poll_outbound().is_none());

        client.send(client_conn, 7, &[1, 2, 3]).unwrap();
        assert!(client.poll_outbound().is_some());
    }

    #[test]
    fn test_connect_exchange() {
        let (server, server_conn, mut client, client_conn) = connected_pair();

        assert!(server.is_connected(server_conn));
        assert!(client.is_connected(client_conn));
        assert_eq!(
            client.poll_event(),
            Some(TransportEvent::Message {
                conn: client_conn,
                msg_type: MSG_CONNECT,
                payload: Vec::new(),
            })
        );
        assert_eq!(client.poll_event(), None);
    }

    #[test]
    fn test_duplicate_accept_raises_connect_once() {
        let (mut server, server_conn, mut client, client_conn) = connected_pair();
        while client.poll_event().is_some() {}

        // A retransmitted request is re-acknowledged
        let request = encode_message(&EngineFrame::ConnectRequest).unwrap();
        server.ingest(server_conn, &request).unwrap();
        pump(&mut server, &mut client, client_conn);

        assert_eq!(client.poll_event(), None);
    }

    #[test]
    fn test_message_delivery_requires_handler() {
        let (mut server, server_conn, mut client, client_conn) = connected_pair();

        client.send(client_conn, 7, b"unhandled").unwrap();
        pump(&mut client, &mut server, server_conn);
        assert_eq!(server.poll_event(), None);

        server.register_handler(7);
        client.send(client_conn, 7, b"handled").unwrap();
        pump(&mut client, &mut server, server_conn);
        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::Message {
                conn: server_conn,
                msg_type: 7,
                payload: b"handled".to_vec(),
            })
        );
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let (mut server, server_conn, mut client, client_conn) = connected_pair();
        server.register_handler(7);

        client.send(client_conn, 7, b"first").unwrap();
        client.send(client_conn, 7, b"second").unwrap();
        let (_, first) = client.poll_outbound().unwrap();
        let (_, second) = client.poll_outbound().unwrap();

        server.ingest(server_conn, &second).unwrap();
        server.ingest(server_conn, &first).unwrap();
        server.ingest(server_conn, &second).unwrap();

        let mut payloads = Vec::new();
        while let Some(TransportEvent::Message { payload, .. }) = server.poll_event() {
            payloads.push(payload);
        }
        assert_eq!(payloads, vec![b"second".to_vec()]);
    }

    #[test]
    fn test_send_before_connect_fails() {
        let mut client = SequencedEngine::new();
        let conn = client.connect_client(HOST, &Topology::default()).unwrap();

        assert_eq!(client.send(conn, 7, b"x"), Err(BridgeError::NotConnected(conn)));
        assert_eq!(
            client.send(ConnectionId(99), 7, b"x"),
            Err(BridgeError::UnknownConnection(ConnectionId(99)))
        );
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let (mut server, server_conn, _, _) = connected_pair();
        let frame = EngineFrame::Message {
            channel: 3,
            sequence: 0,
            msg_type: 7,
            payload: Vec::new(),
        };
        let bytes = encode_message(&frame).unwrap();

        assert_eq!(server.ingest(server_conn, &bytes), Err(BridgeError::InvalidChannel(3)));
    }

    #[test]
    fn test_empty_datagram_ignored() {
        let (mut server, server_conn, _, _) = connected_pair();
        assert!(server.ingest(server_conn, &[]).is_ok());
        assert!(server.ingest(ConnectionId(42), &[]).is_ok());
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_local_connection_loopback() {
        let mut server = SequencedEngine::new();
        server.start_server(&Topology::default()).unwrap();
        server.register_handler(9);
        let local = server.connect_local().unwrap();

        server.send(local, 9, b"self").unwrap();
        assert!(server.poll_outbound().is_none());
        assert!(matches!(
            server.poll_event(),
            Some(TransportEvent::Message { msg_type: 9, .. })
        ));
    }

    #[test]
    fn test_spawn_requires_ready() {
        let (mut server, server_conn, _, _) = connected_pair();

        assert!(server.spawn_player(server_conn).is_err());
        server.set_ready(server_conn).unwrap();
        assert!(server.is_ready(server_conn));

        let entity = server.spawn_player(server_conn).unwrap();
        assert_eq!(server.spawned(), &[SpawnedPlayer { entity, owner: server_conn }]);
    }

    #[test]
    fn test_remote_disconnect_event() {
        let (mut server, server_conn, mut client, client_conn) = connected_pair();

        client.shutdown();
        assert_eq!(client.mode(), EngineMode::Idle);
        let (dest, bytes) = client.poll_outbound().unwrap();
        assert_eq!(dest, HOST);
        server.ingest(server_conn, &bytes).unwrap();

        assert_eq!(server.poll_event(), Some(TransportEvent::Disconnected { conn: server_conn }));
        assert!(!server.is_connected(server_conn));
        assert!(!client.is_connected(client_conn));
    }

    #[test]
    fn test_remove_peer_queues_disconnect() {
        let (mut server, server_conn, _, _) = connected_pair();
        while server.poll_outbound().is_some() {}

        server.remove_peer(server_conn);
        let (dest, bytes) = server.poll_outbound().unwrap();
        assert_eq!(dest, CLIENT);
        let (frame, _) = decode_message::<EngineFrame>(&bytes).unwrap();
        assert_eq!(frame, EngineFrame::Disconnect);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_remove_superseded_peer_is_silent() {
        let (mut server, old_conn, _, _) = connected_pair();
        while server.poll_outbound().is_some() {}

        let new_conn = server.add_peer(CLIENT).unwrap();
        server.remove_peer(old_conn);
        assert!(server.poll_outbound().is_none());
        assert_eq!(server.connection_count(), 1);
        assert!(!server.is_connected(new_conn));
    }
}
