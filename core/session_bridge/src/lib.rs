//! Session Bridge
//!
//! This crate connects two peers that can only reach each other through a
//! relay and rendezvous service, and exposes the result as a connection a
//! reliable message engine can drive:
//! - Lobby lifecycle (create, join, cancel, disconnect, invites)
//! - Host/client handshake over the relay
//! - Peer identity to connection registry
//! - Datagram pump between the relay and the engine
//!
//! Everything runs on one thread, advanced by [`SessionBridge::update`] once
//! per tick.

// ============================================================================
// Modules
// ============================================================================

pub mod adapter;
pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod handshake;
pub mod identity;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::{AdapterStats, TransportAdapter};
pub use bridge::SessionBridge;
pub use channel::{PeerChannel, PeerSessionState};
pub use config::BridgeConfig;
pub use directory::{DirectoryEvent, SessionDirectory, Visibility};
pub use engine::SequencedEngine;
pub use error::BridgeError;
pub use events::{EventQueue, PlatformEvent};
pub use handshake::{HandshakePhase, HandshakeStateMachine, Role, SessionConnectionState};
pub use identity::{
    generate_peer_identity, generate_session_id, parse_connect_lobby, PeerIdentity, SessionId,
    CONNECT_LOBBY_ARG,
};
pub use registry::{ConnectionKind, ConnectionRegistry, PeerConnection};
pub use transport::{
    ConnectionId, MessageType, ReliableTransport, Topology, TransportEvent, MSG_CONNECT,
    MSG_SPAWN_REQUEST,
};
