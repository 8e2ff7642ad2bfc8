//! Error taxonomy for the session bridge

use crate::codec::{DecodeError, EncodeError};
use crate::identity::PeerIdentity;
use crate::protocol::MAX_PEER_FRAME_SIZE;
use crate::transport::ConnectionId;

/// Errors surfaced by the platform boundary, the engine and the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Session/relay services are not initialized
    PlatformUnavailable,
    /// Peer-session request from an identity outside the session
    UnauthorizedPeer(PeerIdentity),
    /// Relay send/receive failure
    Transport(String),
    /// Engine frame too large for one relayed datagram
    FrameTooLarge(usize),
    /// Received datagram larger than the receive buffer; it was discarded
    DatagramTooLarge { sender: PeerIdentity, size: usize },
    /// Spawn request for a peer with no registered connection
    SpawnTargetMissing(PeerIdentity),
    /// A handshake sub-state outlived its deadline
    HandshakeTimeout,
    /// Connection handle not known to the engine
    UnknownConnection(ConnectionId),
    /// Connection exists but has not completed the engine connect exchange
    NotConnected(ConnectionId),
    /// Frame addressed a channel the topology does not define
    InvalidChannel(u8),
    /// Frame encoding failed
    Encode(EncodeError),
    /// Frame decoding failed
    Decode(DecodeError),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::PlatformUnavailable => write!(f, "platform unavailable"),
            BridgeError::UnauthorizedPeer(peer) => write!(f, "unauthorized peer {}", peer),
            BridgeError::Transport(e) => write!(f, "transport error: {}", e),
            BridgeError::FrameTooLarge(size) => write!(
                f,
                "frame of {} bytes exceeds relay datagram limit {}",
                size, MAX_PEER_FRAME_SIZE
            ),
            BridgeError::DatagramTooLarge { sender, size } => {
                write!(f, "discarded {}-byte datagram from {}", size, sender)
            }
            BridgeError::SpawnTargetMissing(peer) => {
                write!(f, "no connection registered for spawn target {}", peer)
            }
            BridgeError::HandshakeTimeout => write!(f, "handshake timed out"),
            BridgeError::UnknownConnection(conn) => write!(f, "unknown connection {}", conn),
            BridgeError::NotConnected(conn) => write!(f, "connection {} not connected", conn),
            BridgeError::InvalidChannel(ch) => write!(f, "invalid channel {}", ch),
            BridgeError::Encode(e) => write!(f, "encode error: {}", e),
            BridgeError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<EncodeError> for BridgeError {
    fn from(e: EncodeError) -> Self {
        BridgeError::Encode(e)
    }
}

impl From<DecodeError> for BridgeError {
    fn from(e: DecodeError) -> Self {
        BridgeError::Decode(e)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}
