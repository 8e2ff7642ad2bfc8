//! Per-peer datagram channel over the relay transport
//!
//! The relay delivers best-effort datagrams between identified peers. A peer
//! that has not been accepted cannot deliver to us: its first datagram raises
//! a session request and is held until [`PeerChannel::accept_session`].

use crate::error::BridgeError;
use crate::identity::PeerIdentity;

/// Relay-level session state with one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSessionState {
    /// No session
    None,
    /// We sent to the peer but have not heard back or accepted it
    Connecting,
    /// Datagrams flow both ways
    Established,
}

impl PeerSessionState {
    pub fn is_established(&self) -> bool {
        matches!(self, PeerSessionState::Established)
    }
}

/// Datagram access to the relay transport
pub trait PeerChannel {
    /// Whether the underlying relay service is initialized
    fn is_ready(&self) -> bool;

    /// Send raw bytes to a peer; sending to an unestablished peer requests a session
    fn send(&mut self, peer: PeerIdentity, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Size of the next available datagram, without blocking
    fn poll_available(&mut self) -> Option<usize>;

    /// Read the next datagram into `buf`, returning its length and sender
    ///
    /// A datagram longer than `buf` is consumed and reported as
    /// [`BridgeError::DatagramTooLarge`], never truncated.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, PeerIdentity), BridgeError>;

    /// Allow datagrams from an unsolicited peer
    fn accept_session(&mut self, peer: PeerIdentity);

    fn session_state(&self, peer: PeerIdentity) -> PeerSessionState;

    fn close_session(&mut self, peer: PeerIdentity);

    /// Next unsolicited peer that tried to reach us
    fn poll_session_request(&mut self) -> Option<PeerIdentity>;
}
