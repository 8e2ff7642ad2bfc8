//! Peer and lobby identifiers
//!
//! Both are opaque 64-bit values. Zero is reserved as the "cleared" value,
//! so generated identifiers are never zero.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// Command line switch carrying a lobby to join at startup
pub const CONNECT_LOBBY_ARG: &str = "+connect_lobby";

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of a peer on the relay network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(pub u64);

/// Identity of a rendezvous session (lobby)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl PeerIdentity {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(PeerIdentity)
    }
}

impl FromStr for SessionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(SessionId)
    }
}

// ============================================================================
// Generation
// ============================================================================

fn random_nonzero_u64(rng: &SystemRandom) -> u64 {
    let mut buf = [0u8; 8];
    loop {
        // OS entropy unavailable: use a time-derived value
        let value = match rng.fill(&mut buf) {
            Ok(()) => u64::from_ne_bytes(buf),
            Err(_) => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(1),
        };
        if value != 0 {
            return value;
        }
    }
}

/// Generate a random peer identity using CSPRNG
pub fn generate_peer_identity() -> PeerIdentity {
    PeerIdentity(random_nonzero_u64(&SystemRandom::new()))
}

/// Generate a random lobby identifier using CSPRNG
pub fn generate_session_id() -> SessionId {
    SessionId(random_nonzero_u64(&SystemRandom::new()))
}

// ============================================================================
// Command Line
// ============================================================================

/// Find `+connect_lobby <id>` in process arguments
///
/// The last occurrence wins. A value that does not parse as a lobby id is
/// ignored.
pub fn parse_connect_lobby(args: &[String]) -> Option<SessionId> {
    let mut input = None;
    for (i, arg) in args.iter().enumerate() {
        if arg == CONNECT_LOBBY_ARG {
            if let Some(value) = args.get(i + 1) {
                input = Some(value.as_str());
            }
        }
    }

    let input = input?;
    match input.parse::<SessionId>() {
        Ok(id) => Some(id),
        Err(e) => {
            log::warn!("Ignoring {} '{}': {}", CONNECT_LOBBY_ARG, input, e);
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
