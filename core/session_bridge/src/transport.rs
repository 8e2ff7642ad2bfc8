//! Reliable-transport engine boundary
//!
//! The bridge drives a connection-oriented message engine without knowing
//! how it frames or orders data. Inbound relay bytes are handed to
//! [`ReliableTransport::ingest`]; outbound frames are pulled with
//! [`ReliableTransport::poll_outbound`] and sent over the relay.
//!
//! Handler registration replaces callbacks: a registered message type is
//! surfaced through [`ReliableTransport::poll_event`], anything else is
//! dropped by the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::identity::PeerIdentity;

// ============================================================================
// Message Types
// ============================================================================

/// Numeric message type id
pub type MessageType = u16;

/// Engine control message: connection established
pub const MSG_CONNECT: MessageType = 32;

/// Client asks the host to spawn its player
pub const MSG_SPAWN_REQUEST: MessageType = 1002;

// ============================================================================
// Handles
// ============================================================================

/// Engine-assigned connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Engine-assigned id for a spawned player entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

// ============================================================================
// Topology
// ============================================================================

/// Delivery guarantee of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosType {
    Unreliable,
    Reliable,
    ReliableSequenced,
}

/// Channel layout and connection capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub channels: Vec<QosType>,
    pub max_connections: usize,
}

impl Topology {
    /// Single reliable-sequenced channel with room for the local player and one peer
    pub fn reliable_sequenced() -> Self {
        Topology {
            channels: vec![QosType::ReliableSequenced],
            max_connections: 2,
        }
    }

    pub fn has_channel(&self, channel: u8) -> bool {
        (channel as usize) < self.channels.len()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::reliable_sequenced()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Event raised by the engine for the bridge to consume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message of a registered type arrived
    Message {
        conn: ConnectionId,
        msg_type: MessageType,
        payload: Vec<u8>,
    },
    /// The remote end closed the connection
    Disconnected { conn: ConnectionId },
}

// ============================================================================
// Engine Trait
// ============================================================================

/// The message engine the bridge feeds
pub trait ReliableTransport {
    /// Start the server side; it reports active after a later [`update`](Self::update)
    fn start_server(&mut self, topology: &Topology) -> Result<(), BridgeError>;

    fn is_server_active(&self) -> bool;

    /// Per-tick housekeeping
    fn update(&mut self);

    /// Connection representing the host's own player
    fn connect_local(&mut self) -> Result<ConnectionId, BridgeError>;

    /// Register an external connection for a remote peer on the running server
    fn add_peer(&mut self, peer: PeerIdentity) -> Result<ConnectionId, BridgeError>;

    fn remove_peer(&mut self, conn: ConnectionId);

    /// Create the client-side connection to `host` and begin the connect exchange
    fn connect_client(
        &mut self,
        host: PeerIdentity,
        topology: &Topology,
    ) -> Result<ConnectionId, BridgeError>;

    /// Deliver bytes received from the relay to a connection
    fn ingest(&mut self, conn: ConnectionId, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Next frame the engine wants sent, with its destination
    fn poll_outbound(&mut self) -> Option<(PeerIdentity, Vec<u8>)>;

    fn poll_event(&mut self) -> Option<TransportEvent>;

    fn register_handler(&mut self, msg_type: MessageType);

    fn unregister_handler(&mut self, msg_type: MessageType);

    fn send(
        &mut self,
        conn: ConnectionId,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(), BridgeError>;

    fn set_ready(&mut self, conn: ConnectionId) -> Result<(), BridgeError>;

    /// Spawn a player entity with authority assigned to `conn`
    fn spawn_player(&mut self, conn: ConnectionId) -> Result<EntityId, BridgeError>;

    fn is_connected(&self, conn: ConnectionId) -> bool;

    /// Stop server and client, queueing disconnect frames for remote peers
    fn shutdown(&mut self);
}
