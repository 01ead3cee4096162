//! Connected peers and the directory the mixer iterates each tick

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::avatar::data::ScaleBounds;
use crate::mixer::client_data::AvatarClientData;

/// Stable identifier of a connected peer
pub type PeerId = Uuid;

/// What kind of node a peer is, fixed at connection time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// An interactive client with an avatar
    Agent,
    AudioMixer,
    EntityServer,
    AssetServer,
    Other,
}

impl PeerRole {
    /// Only agents have avatars and take part in the broadcast
    pub fn carries_avatar(&self) -> bool {
        matches!(self, PeerRole::Agent)
    }
}

/// One connection of a peer. Reconnecting with the same id starts a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: PeerId,
    pub session: u64,
}

/// A connected peer
pub struct Peer {
    id: PeerId,
    role: PeerRole,
    session: u64,
    ignore_radius_enabled: AtomicBool,
    /// Peers this one explicitly asked not to hear
    ignored: RwLock<HashSet<PeerId>>,
    /// Created on the first avatar update
    client_data: OnceLock<Mutex<AvatarClientData>>,
}

impl Peer {
    pub fn new(id: PeerId, role: PeerRole) -> Self {
        Self::with_session(id, role, 0)
    }

    pub fn with_session(id: PeerId, role: PeerRole, session: u64) -> Self {
        Self {
            id,
            role,
            session,
            ignore_radius_enabled: AtomicBool::new(false),
            ignored: RwLock::new(HashSet::new()),
            client_data: OnceLock::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> PeerId {
        self.id
    }

    #[inline]
    pub fn role(&self) -> PeerRole {
        self.role
    }

    #[inline]
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            id: self.id,
            session: self.session,
        }
    }

    #[inline]
    pub fn is_ignore_radius_enabled(&self) -> bool {
        self.ignore_radius_enabled.load(Ordering::Relaxed)
    }

    pub fn set_ignore_radius_enabled(&self, enabled: bool) {
        self.ignore_radius_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Avatar state, if this peer has sent any yet
    #[inline]
    pub fn client_data(&self) -> Option<&Mutex<AvatarClientData>> {
        self.client_data.get()
    }

    /// Avatar state, created with the given domain scale bounds on first use.
    /// Returns None for peers that never carry an avatar.
    pub fn get_or_create_client_data(&self, bounds: ScaleBounds) -> Option<&Mutex<AvatarClientData>> {
        if !self.role.carries_avatar() {
            return None;
        }
        Some(
            self.client_data
                .get_or_init(|| Mutex::new(AvatarClientData::new(bounds))),
        )
    }

    /// Non-blocking ignore check. None if the ignore set is being written.
    pub fn try_is_ignoring(&self, other: PeerId) -> Option<bool> {
        self.ignored.try_read().map(|set| set.contains(&other))
    }

    pub fn add_ignored(&self, other: PeerId) {
        if other != self.id {
            self.ignored.write().insert(other);
        }
    }

    pub fn remove_ignored(&self, other: PeerId) -> bool {
        self.ignored.write().remove(&other)
    }

    /// Non-blocking removal used by disconnect cleanup. None if contended.
    pub fn try_remove_ignored(&self, other: PeerId) -> Option<bool> {
        self.ignored.try_write().map(|mut set| set.remove(&other))
    }

    pub fn ignored_count(&self) -> usize {
        self.ignored.read().len()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("session", &self.session)
            .field("ignore_radius_enabled", &self.is_ignore_radius_enabled())
            .field("has_client_data", &self.client_data.get().is_some())
            .finish()
    }
}

/// Directory of connected peers
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    next_session: AtomicU64,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer as a new session. Returns it along with the session it
    /// replaced, if the id was already connected.
    pub fn insert(&self, id: PeerId, role: PeerRole) -> (Arc<Peer>, Option<Arc<Peer>>) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let peer = Arc::new(Peer::with_session(id, role, session));
        let replaced = self.peers.write().insert(id, peer.clone());
        (peer, replaced)
    }

    /// Remove `key`'s session. A newer session under the same id is left alone.
    pub fn remove_session(&self, key: SessionKey) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write();
        match peers.get(&key.id) {
            Some(peer) if peer.session == key.session => peers.remove(&key.id),
            _ => None,
        }
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    /// Snapshot of every peer matching `predicate`
    pub fn list_matching<F>(&self, predicate: F) -> Vec<Arc<Peer>>
    where
        F: Fn(&Peer) -> bool,
    {
        self.peers
            .read()
            .values()
            .filter(|peer| predicate(peer))
            .cloned()
            .collect()
    }

    /// Snapshot of every agent
    pub fn agents(&self) -> Vec<Arc<Peer>> {
        self.list_matching(|peer| peer.role().carries_avatar())
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_agents_get_client_data() {
        let agent = Peer::new(Uuid::new_v4(), PeerRole::Agent);
        let mixer = Peer::new(Uuid::new_v4(), PeerRole::AudioMixer);

        assert!(agent.client_data().is_none());
        assert!(agent.get_or_create_client_data(ScaleBounds::default()).is_some());
        assert!(agent.client_data().is_some());

        assert!(mixer.get_or_create_client_data(ScaleBounds::default()).is_none());
        assert!(mixer.client_data().is_none());
    }

    #[test]
    fn test_ignore_set() {
        let peer = Peer::new(Uuid::new_v4(), PeerRole::Agent);
        let other = Uuid::new_v4();

        assert_eq!(peer.try_is_ignoring(other), Some(false));
        peer.add_ignored(other);
        assert_eq!(peer.try_is_ignoring(other), Some(true));

        // A peer never ignores itself
        peer.add_ignored(peer.id());
        assert_eq!(peer.ignored_count(), 1);

        assert_eq!(peer.try_remove_ignored(other), Some(true));
        assert_eq!(peer.try_is_ignoring(other), Some(false));
    }

    #[test]
    fn test_directory_listing() {
        let directory = PeerDirectory::new();
        let (a, _) = directory.insert(Uuid::new_v4(), PeerRole::Agent);
        directory.insert(Uuid::new_v4(), PeerRole::Agent);
        directory.insert(Uuid::new_v4(), PeerRole::EntityServer);

        assert_eq!(directory.len(), 3);
        assert_eq!(directory.agents().len(), 2);

        assert!(directory.remove_session(a.session_key()).is_some());
        assert!(directory.get(a.id()).is_none());
        assert_eq!(directory.agents().len(), 1);
    }

    #[test]
    fn test_stale_session_not_removed() {
        let directory = PeerDirectory::new();
        let id = Uuid::new_v4();
        let (first, replaced) = directory.insert(id, PeerRole::Agent);
        assert!(replaced.is_none());

        let (second, replaced) = directory.insert(id, PeerRole::Agent);
        assert_ne!(first.session_key(), second.session_key());
        assert!(Arc::ptr_eq(&replaced.unwrap(), &first));

        assert!(directory.remove_session(first.session_key()).is_none());
        assert!(Arc::ptr_eq(&directory.get(id).unwrap(), &second));

        assert!(directory.remove_session(second.session_key()).is_some());
        assert!(directory.is_empty());
    }
}
