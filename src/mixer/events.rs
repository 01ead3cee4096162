//! Peer lifecycle events from the transport to the broadcast loop
//!
//! Connection handlers push disconnect notifications without blocking; the
//! broadcast loop drains them at the start of each tick. The channel is
//! unbounded because a lost disconnect would leak per-pair state forever.

use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};

use crate::net::peer::{PeerId, SessionKey};
use crate::net::protocol::KillAvatarReason;

/// Something that happened to a peer session outside the tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// Transport lost the session
    Disconnected(SessionKey),
    /// The peer asked for its avatar to be removed
    KillRequested(SessionKey),
    /// The id reconnected before this session was removed
    Replaced(SessionKey),
}

impl PeerEvent {
    #[inline]
    pub fn session(&self) -> SessionKey {
        match self {
            PeerEvent::Disconnected(key) | PeerEvent::KillRequested(key) | PeerEvent::Replaced(key) => *key,
        }
    }

    #[inline]
    pub fn peer_id(&self) -> PeerId {
        self.session().id
    }

    /// Reason reported to the remaining avatars. None when the id is still
    /// connected under a newer session.
    pub fn kill_reason(&self) -> Option<KillAvatarReason> {
        match self {
            PeerEvent::Disconnected(_) => Some(KillAvatarReason::AvatarDisconnected),
            PeerEvent::KillRequested(_) => Some(KillAvatarReason::NoReason),
            PeerEvent::Replaced(_) => None,
        }
    }
}

/// Queue drained once per tick
pub struct PeerEventQueue {
    sender: Sender<PeerEvent>,
    receiver: Receiver<PeerEvent>,
}

impl PeerEventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Handle for a connection handler
    pub fn sender(&self) -> PeerEventSender {
        PeerEventSender {
            sender: self.sender.clone(),
        }
    }

    #[inline]
    pub fn push(&self, event: PeerEvent) {
        // Both ends live in self, so the channel cannot be disconnected here
        let _ = self.sender.try_send(event);
    }

    /// Everything queued since the last drain
    pub fn drain(&self) -> Vec<PeerEvent> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for PeerEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable sender handle for connection handlers
#[derive(Clone)]
pub struct PeerEventSender {
    sender: Sender<PeerEvent>,
}

impl PeerEventSender {
    pub fn disconnected(&self, session: SessionKey) -> Result<(), PeerEventError> {
        self.send(PeerEvent::Disconnected(session))
    }

    pub fn send(&self, event: PeerEvent) -> Result<(), PeerEventError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => PeerEventError::Full,
            TrySendError::Disconnected(_) => PeerEventError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerEventError {
    #[error("Peer event queue is full")]
    Full,
    /// The mixer has shut down
    #[error("Peer event queue is closed")]
    Closed,
}
