//! Rendezvous session (lobby) directory
//!
//! Create and join complete asynchronously: the call only starts the
//! request, and the outcome arrives later as a [`DirectoryEvent`].

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::identity::{PeerIdentity, SessionId};

/// Who may discover a lobby
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Private,
    FriendsOnly,
    Public,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Private
    }
}

/// Completion and out-of-band events from the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// We are now a member of the lobby
    SessionEntered(SessionId),
    /// A create or join request was refused
    SessionEnterFailed {
        session: Option<SessionId>,
        reason: String,
    },
    /// The user accepted an invite from outside the application
    InviteAccepted(SessionId),
}

/// Access to the rendezvous service
pub trait SessionDirectory {
    /// Whether the underlying platform service is initialized
    fn is_ready(&self) -> bool;

    fn create_session(
        &mut self,
        visibility: Visibility,
        max_members: usize,
    ) -> Result<(), BridgeError>;

    fn join_session(&mut self, id: SessionId) -> Result<(), BridgeError>;

    fn leave_session(&mut self, id: SessionId);

    fn owner(&self, id: SessionId) -> Result<PeerIdentity, BridgeError>;

    fn members(&self, id: SessionId) -> Result<Vec<PeerIdentity>, BridgeError>;

    /// Our own identity
    fn local_identity(&self) -> Result<PeerIdentity, BridgeError>;

    /// Show the out-of-band invite prompt for a lobby
    fn show_invite_dialog(&mut self, id: SessionId);

    fn poll_event(&mut self) -> Option<DirectoryEvent>;
}
