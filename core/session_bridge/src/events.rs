//! Single-consumer event queue
//!
//! Directory completions, relay session requests and externally delivered
//! invites are funneled here and consumed once per tick.

use std::collections::VecDeque;

use crate::directory::DirectoryEvent;
use crate::identity::{PeerIdentity, SessionId};

/// Everything that can drive a handshake transition from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    SessionEntered(SessionId),
    SessionEnterFailed {
        session: Option<SessionId>,
        reason: String,
    },
    InviteAccepted(SessionId),
    PeerSessionRequested(PeerIdentity),
}

impl From<DirectoryEvent> for PlatformEvent {
    fn from(event: DirectoryEvent) -> Self {
        match event {
            DirectoryEvent::SessionEntered(id) => PlatformEvent::SessionEntered(id),
            DirectoryEvent::SessionEnterFailed { session, reason } => {
                PlatformEvent::SessionEnterFailed { session, reason }
            }
            DirectoryEvent::InviteAccepted(id) => PlatformEvent::InviteAccepted(id),
        }
    }
}

/// FIFO of pending platform events
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<PlatformEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: PlatformEvent) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<PlatformEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
