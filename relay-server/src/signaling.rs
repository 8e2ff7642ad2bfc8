//! Relay session acceptance
//!
//! A receiver only gets datagrams from senders it accepted, either with
//! AcceptSession or implicitly by sending to them first. Datagrams from an
//! unaccepted sender are held, and the first one raises a single
//! SessionRequest.
//!
//! # Protocol Flow
//!
//! ```text
//! Sender                     Relay                      Receiver
//!   │── Datagram{rcv} ─────────►│                          │
//!   │                           │── SessionRequest{snd} ──►│
//!   │                           │◄── AcceptSession{snd} ───│
//!   │                           │── Datagram{snd} ────────►│  (held)
//! ```

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use session_bridge::PeerIdentity;

// ============================================================================
// Constants
// ============================================================================

/// Default lifetime of an unanswered session request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Datagrams held per (receiver, sender) pair
pub const MAX_HELD_DATAGRAMS: usize = 64;

// ============================================================================
// Pending Request
// ============================================================================

/// Datagrams waiting for the receiver to accept their sender
#[derive(Debug)]
pub struct PendingRequest {
    pub datagrams: Vec<Vec<u8>>,
    pub created_at: Instant,
}

/// What happened to a datagram handed to [`SessionTable::hold`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// First datagram from this sender: notify the receiver
    NewRequest,
    Held,
    /// Buffer full
    Dropped,
}

// ============================================================================
// Session Table
// ============================================================================

pub struct SessionTable {
    /// receiver → senders it accepts
    accepted: HashMap<PeerIdentity, HashSet<PeerIdentity>>,
    /// (receiver, sender) → held datagrams
    pending: HashMap<(PeerIdentity, PeerIdentity), PendingRequest>,
    request_timeout: Duration,
}

impl SessionTable {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            accepted: HashMap::new(),
            pending: HashMap::new(),
            request_timeout,
        }
    }

    pub fn is_accepted(&self, receiver: PeerIdentity, sender: PeerIdentity) -> bool {
        self.accepted
            .get(&receiver)
            .map(|s| s.contains(&sender))
            .unwrap_or(false)
    }

    /// Accept `sender` on behalf of `receiver`, returning any held datagrams
    pub fn accept(&mut self, receiver: PeerIdentity, sender: PeerIdentity) -> Vec<Vec<u8>> {
        if self.accepted.entry(receiver).or_default().insert(sender) {
            log::debug!("Peer {} accepted session with {}", receiver, sender);
        }
        match self.pending.remove(&(receiver, sender)) {
            Some(request) => {
                log::info!(
                    "Releasing {} held datagram(s) {} -> {}",
                    request.datagrams.len(),
                    sender,
                    receiver
                );
                request.datagrams
            }
            None => Vec::new(),
        }
    }

    pub fn hold(
        &mut self,
        receiver: PeerIdentity,
        sender: PeerIdentity,
        payload: Vec<u8>,
        now: Instant,
    ) -> HoldOutcome {
        let mut outcome = HoldOutcome::Held;
        let request = self.pending.entry((receiver, sender)).or_insert_with(|| {
            outcome = HoldOutcome::NewRequest;
            PendingRequest {
                datagrams: Vec::new(),
                created_at: now,
            }
        });
        if request.datagrams.len() >= MAX_HELD_DATAGRAMS {
            return HoldOutcome::Dropped;
        }
        request.datagrams.push(payload);
        outcome
    }

    /// Forget session state `receiver` holds about `sender`
    pub fn close(&mut self, receiver: PeerIdentity, sender: PeerIdentity) {
        if let Some(senders) = self.accepted.get_mut(&receiver) {
            senders.remove(&sender);
            if senders.is_empty() {
                self.accepted.remove(&receiver);
            }
        }
        self.pending.remove(&(receiver, sender));
        log::debug!("Peer {} closed session with {}", receiver, sender);
    }

    /// Drop requests older than the timeout, returning (receiver, sender) pairs
    pub fn expire(&mut self, now: Instant) -> Vec<(PeerIdentity, PeerIdentity)> {
        let timeout = self.request_timeout;
        let expired: Vec<(PeerIdentity, PeerIdentity)> = self
            .pending
            .iter()
            .filter(|(_, r)| now.duration_since(r.created_at) > timeout)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.pending.remove(key);
            log::info!("Session request {} -> {} expired", key.1, key.0);
        }
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RCV: PeerIdentity = PeerIdentity(100);
    const SND: PeerIdentity = PeerIdentity(200);

    #[test]
    fn test_first_hold_is_new_request() {
        let mut table = SessionTable::default();
        let now = Instant::now();

        assert_eq!(table.hold(RCV, SND, vec![], now), HoldOutcome::NewRequest);
        assert_eq!(table.hold(RCV, SND, vec![1], now), HoldOutcome::Held);
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn test_accept_releases_held() {
        let mut table = SessionTable::default();
        let now = Instant::now();
        table.hold(RCV, SND, vec![1], now);
        table.hold(RCV, SND, vec![2], now);

        assert_eq!(table.accept(RCV, SND), vec![vec![1], vec![2]]);
        assert!(table.is_accepted(RCV, SND));
        assert!(!table.is_accepted(SND, RCV));
        assert!(table.accept(RCV, SND).is_empty());
    }

    #[test]
    fn test_hold_bounded() {
        let mut table = SessionTable::default();
        let now = Instant::now();
        for _ in 0..MAX_HELD_DATAGRAMS {
            table.hold(RCV, SND, vec![0], now);
        }
        assert_eq!(table.hold(RCV, SND, vec![0], now), HoldOutcome::Dropped);
    }

    #[test]
    fn test_close_forgets_acceptance() {
        let mut table = SessionTable::default();
        table.accept(RCV, SND);
        table.close(RCV, SND);
        assert!(!table.is_accepted(RCV, SND));
    }

    #[test]
    fn test_expire() {
        let mut table = SessionTable::new(Duration::from_millis(100));
        let now = Instant::now();
        table.hold(RCV, SND, vec![], now);

        assert!(table.expire(now + Duration::from_millis(50)).is_empty());
        assert_eq!(table.expire(now + Duration::from_millis(200)), vec![(RCV, SND)]);
        assert_eq!(table.pending_count(), 0);
    }
}
