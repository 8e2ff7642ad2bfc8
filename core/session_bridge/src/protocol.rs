//! Relay wire protocol and bridge-level messages
//!
//! Nodes talk to the relay server over UDP. Each datagram carries exactly one
//! length-prefixed [`RelayMessage`].
//!
//! # Handshake Through The Relay
//!
//! ```text
//! Client                    Relay                      Host
//!   │                         │                          │
//!   │── Datagram{host, []} ──►│                          │
//!   │                         │── SessionRequest{cli} ──►│
//!   │                         │◄── AcceptSession{cli} ───│
//!   │                         │── Datagram{cli, []} ────►│  (held datagram)
//!   │                         │◄── Datagram{cli, []} ────│  (confirmation)
//!   │◄── Datagram{host, []} ──│                          │
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::{decode_message, encode_message, DecodeError, EncodeError, HEADER_LEN};
use crate::directory::Visibility;
use crate::identity::{PeerIdentity, SessionId};

/// Default UDP port of the relay server
pub const DEFAULT_RELAY_PORT: u16 = 27015;

/// Largest UDP datagram either side reads
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Largest payload one UDP/IPv4 datagram can carry
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Bytes `RelayMessage::Datagram` adds around a peer payload:
/// length prefix, variant tag, peer id and payload length
pub const DATAGRAM_OVERHEAD: usize = HEADER_LEN + 4 + 8 + 8;

/// Largest engine frame that still fits in one relayed datagram
pub const MAX_PEER_FRAME_SIZE: usize = MAX_UDP_PAYLOAD - DATAGRAM_OVERHEAD;

// ============================================================================
// Relay Messages
// ============================================================================

/// Messages exchanged between a node and the relay server
///
/// `peer` fields name the destination on messages a node sends and the
/// source on messages the relay delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Bind our identity to the sending address
    Hello { peer: PeerIdentity },

    /// Registration acknowledged
    Welcome { peer: PeerIdentity },

    /// Create a lobby owned by the sender
    CreateLobby { visibility: Visibility, capacity: u32 },

    JoinLobby { lobby: SessionId },

    LeaveLobby { lobby: SessionId },

    /// The sender is now a member of `lobby`
    LobbyEntered {
        lobby: SessionId,
        owner: PeerIdentity,
        members: Vec<PeerIdentity>,
    },

    /// Membership or ownership changed
    LobbyUpdated {
        lobby: SessionId,
        owner: PeerIdentity,
        members: Vec<PeerIdentity>,
    },

    LobbyEnterFailed {
        lobby: Option<SessionId>,
        code: RelayError,
    },

    /// Peer datagram
    Datagram { peer: PeerIdentity, payload: Vec<u8> },

    /// Accept datagrams from `peer`
    AcceptSession { peer: PeerIdentity },

    /// Drop session state with `peer`
    CloseSession { peer: PeerIdentity },

    /// `peer` tried to reach us and is waiting for acceptance
    SessionRequest { peer: PeerIdentity },

    /// A datagram to `peer` could not be delivered
    SendFailed { peer: PeerIdentity, code: RelayError },

    /// Error response
    Error { code: RelayError, message: String },
}

/// Relay error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RelayError {
    /// Unknown or internal error
    Unknown = 0,
    /// Lobby does not exist
    LobbyNotFound = 1,
    /// Lobby is at capacity
    LobbyFull = 2,
    /// Sender has not sent Hello
    NotRegistered = 3,
    /// Destination peer is not registered
    PeerUnreachable = 4,
    /// Invalid message format
    InvalidMessage = 5,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Unknown => write!(f, "unknown error"),
            RelayError::LobbyNotFound => write!(f, "lobby not found"),
            RelayError::LobbyFull => write!(f, "lobby full"),
            RelayError::NotRegistered => write!(f, "not registered"),
            RelayError::PeerUnreachable => write!(f, "peer unreachable"),
            RelayError::InvalidMessage => write!(f, "invalid message"),
        }
    }
}

impl RelayMessage {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_message(self)
    }

    /// Decode a single message from one UDP datagram
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        decode_message(buf).map(|(msg, _)| msg)
    }

    /// Create an error response
    pub fn error(code: RelayError, message: impl Into<String>) -> Self {
        RelayMessage::Error {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// Spawn Request
// ============================================================================

/// Payload of [`MSG_SPAWN_REQUEST`](crate::transport::MSG_SPAWN_REQUEST)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub peer: PeerIdentity,
}

impl SpawnRequest {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_message(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        decode_message(buf).map(|(msg, _)| msg)
    }
}

// ============================================================================
// Tests
// ============================================================================
