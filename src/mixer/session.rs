//! The mixer: ingestion on one side, the broadcast loop on the other
//!
//! `AvatarMixer` is shared with every connection handler. Handlers call
//! `handle_packet` for inbound data (blocking briefly on that one peer's
//! lock is fine there) and report disconnects through the event queue.
//!
//! `MixerLoop` is owned by the broadcast task. Each tick it applies queued
//! disconnects, runs the scheduler, feeds the throttle and, once per second,
//! publishes a stats snapshot.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::MixerConfig;
use crate::metrics::Metrics;
use crate::mixer::broadcast::{BroadcastScheduler, BroadcastSettings};
use crate::mixer::events::{PeerEvent, PeerEventQueue, PeerEventSender};
use crate::mixer::performance::{PerformanceThrottle, ThrottleHandle};
use crate::mixer::stats::{MixerStatsSnapshot, StatsAggregator, TickCounters};
use crate::net::peer::{Peer, PeerDirectory, PeerId, PeerRole, SessionKey};
use crate::net::protocol::{decode, DecodeError, InboundPacket, KillAvatarReason, OutboundPacket};
use crate::net::transport::{Transport, TransportError};

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Peer {0} is a {1:?} and has no avatar")]
    NotAnAgent(PeerId, PeerRole),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Shared mixer state
pub struct AvatarMixer {
    config: MixerConfig,
    directory: PeerDirectory,
    transport: Arc<dyn Transport>,
    events: PeerEventQueue,
    metrics: Arc<Metrics>,
}

impl AvatarMixer {
    pub fn new(config: MixerConfig, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            directory: PeerDirectory::new(),
            transport,
            events: PeerEventQueue::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Handle for connection handlers to report disconnects
    pub fn event_sender(&self) -> PeerEventSender {
        self.events.sender()
    }

    /// Register a newly connected peer. A reconnect under a live id replaces
    /// the old session, whose per-pair state is dropped next tick.
    pub fn add_peer(&self, id: PeerId, role: PeerRole) -> Arc<Peer> {
        let (peer, replaced) = self.directory.insert(id, role);
        if let Some(old) = replaced {
            self.events.push(PeerEvent::Replaced(old.session_key()));
        }
        self.metrics.peers.store(self.directory.len() as u64, Ordering::Relaxed);
        info!("Peer {} connected as {:?}", id, role);
        peer
    }

    /// Queue removal of a session; applied at the start of the next tick
    pub fn peer_disconnected(&self, session: SessionKey) {
        self.events.push(PeerEvent::Disconnected(session));
    }

    /// Decode and apply one inbound packet from `sender`
    pub fn handle_packet(&self, sender: PeerId, bytes: &[u8]) -> Result<(), MixerError> {
        self.metrics.packets_received.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let peer = self
            .directory
            .get(sender)
            .ok_or(MixerError::UnknownPeer(sender))?;
        let packet = decode::<InboundPacket>(bytes).map_err(|e| {
            self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        self.apply(&peer, packet, bytes.len())
    }

    fn apply(&self, peer: &Peer, packet: InboundPacket, packet_bytes: usize) -> Result<(), MixerError> {
        match packet {
            InboundPacket::AvatarData { sequence, pose } => {
                let data = peer
                    .get_or_create_client_data(self.config.scale_bounds())
                    .ok_or(MixerError::NotAnAgent(peer.id(), peer.role()))?;
                if !data
                    .lock()
                    .apply_avatar_update(sequence, pose, packet_bytes, Instant::now())
                {
                    self.metrics.stale_updates.fetch_add(1, Ordering::Relaxed);
                }
            }
            InboundPacket::AvatarIdentity(identity) => {
                let data = peer
                    .get_or_create_client_data(self.config.scale_bounds())
                    .ok_or(MixerError::NotAnAgent(peer.id(), peer.role()))?;
                if data.lock().apply_identity(identity, Instant::now()) {
                    debug!("Avatar {} changed identity", peer.id());
                }
            }
            InboundPacket::KillAvatar => {
                self.events.push(PeerEvent::KillRequested(peer.session_key()));
            }
            InboundPacket::NodeIgnoreRequest { ignored, enabled } => {
                for other in ignored {
                    if enabled {
                        peer.add_ignored(other);
                    } else {
                        peer.remove_ignored(other);
                    }
                }
            }
            InboundPacket::RadiusIgnoreRequest { enabled } => {
                peer.set_ignore_radius_enabled(enabled);
                debug!("Peer {} ignore radius {}", peer.id(), enabled);
            }
        }
        Ok(())
    }
}

/// A departed peer whose id is still referenced by some peers' state
struct PendingPurge {
    departed: PeerId,
    remaining: Vec<Arc<Peer>>,
}

/// Remove every reference to `departed` from `peer`. False if a lock was busy.
fn purge_from(peer: &Peer, departed: PeerId) -> bool {
    if peer.try_remove_ignored(departed).is_none() {
        return false;
    }
    match peer.client_data() {
        None => true,
        Some(data) => match data.try_lock() {
            Some(mut data) => {
                data.forget_peer(departed);
                true
            }
            None => false,
        },
    }
}

/// State owned by the broadcast task
pub struct MixerLoop {
    mixer: Arc<AvatarMixer>,
    scheduler: BroadcastScheduler,
    throttle: PerformanceThrottle,
    stats: StatsAggregator,
    pending_purges: Vec<PendingPurge>,
    latest_snapshot: Option<MixerStatsSnapshot>,
    tick_count: u64,
}

impl MixerLoop {
    pub fn new(mixer: Arc<AvatarMixer>) -> Self {
        let scheduler = BroadcastScheduler::new(BroadcastSettings::from(mixer.config()));
        Self::with_scheduler(mixer, scheduler)
    }

    pub fn with_scheduler(mixer: Arc<AvatarMixer>, scheduler: BroadcastScheduler) -> Self {
        let tick_rate = mixer.config().tick_rate;
        Self {
            mixer,
            scheduler,
            throttle: PerformanceThrottle::new(tick_rate),
            stats: StatsAggregator::new(tick_rate),
            pending_purges: Vec::new(),
            latest_snapshot: None,
            tick_count: 0,
        }
    }

    pub fn mixer(&self) -> &Arc<AvatarMixer> {
        &self.mixer
    }

    pub fn throttle_handle(&self) -> ThrottleHandle {
        self.throttle.handle()
    }

    pub fn throttle(&self) -> &PerformanceThrottle {
        &self.throttle
    }

    /// Departed peers not yet purged from everyone
    pub fn pending_purges(&self) -> usize {
        self.pending_purges.len()
    }

    pub fn latest_snapshot(&self) -> Option<&MixerStatsSnapshot> {
        self.latest_snapshot.as_ref()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// One broadcast tick
    pub fn tick(&mut self) -> TickCounters {
        let started = Instant::now();
        self.throttle.tick_start();

        self.process_events();
        self.retry_purges();

        let agents = self.mixer.directory.agents();
        let counters = self.scheduler.run_tick(&agents, self.mixer.transport.as_ref());

        self.stats.record_tick(&counters);
        let metrics = self.mixer.metrics.clone();
        metrics.record_tick(&counters);
        metrics.record_tick_time(started.elapsed());
        metrics.agents.store(agents.len() as u64, Ordering::Relaxed);

        let ratio = self.throttle.tick_end();
        metrics.set_throttle(ratio, self.throttle.trailing_sleep_percentage());

        if self.stats.window_complete() {
            let snapshot = self.take_snapshot();
            debug!(
                "Stats: {:.1} listeners, {:.2} identity/frame, sleeping {:.1}%, throttle {:.2}",
                snapshot.average_listeners_last_second,
                snapshot.average_identity_packets_per_frame,
                snapshot.trailing_sleep_percentage,
                snapshot.performance_throttling_ratio
            );
            metrics.publish_stats(&snapshot);
            self.latest_snapshot = Some(snapshot);
        }

        self.tick_count += 1;
        counters
    }

    fn take_snapshot(&mut self) -> MixerStatsSnapshot {
        #[allow(unused_mut)]
        let mut snapshot = self.stats.take_snapshot(
            self.throttle.trailing_sleep_percentage(),
            self.throttle.throttling_ratio(),
            self.mixer.directory.len(),
        );
        #[cfg(feature = "avatar_stats")]
        {
            let now = Instant::now();
            for peer in self.mixer.directory.agents() {
                if let Some(mut data) = peer.client_data().and_then(|data| data.try_lock()) {
                    snapshot.avatars.insert(peer.id(), data.stats(now));
                }
            }
        }
        snapshot
    }

    fn process_events(&mut self) {
        for event in self.mixer.events.drain() {
            self.apply_event(event);
        }
    }

    fn apply_event(&mut self, event: PeerEvent) {
        let key = event.session();
        match event.kill_reason() {
            Some(reason) => {
                let Some(peer) = self.mixer.directory.remove_session(key) else {
                    debug!("Session {} of peer {} already gone", key.session, key.id);
                    return;
                };
                self.announce_departure(&peer, reason);
            }
            None => debug!("Peer {} reconnected, dropping session {}", key.id, key.session),
        }

        self.pending_purges.push(PendingPurge {
            departed: key.id,
            remaining: self.mixer.directory.list_matching(|peer| peer.id() != key.id),
        });
    }

    fn announce_departure(&self, peer: &Peer, reason: KillAvatarReason) {
        let mixer = &self.mixer;
        let id = peer.id();
        mixer.metrics.peers.store(mixer.directory.len() as u64, Ordering::Relaxed);
        mixer.metrics.disconnects.fetch_add(1, Ordering::Relaxed);
        info!("Peer {} removed ({:?})", id, reason);

        // Only avatars other clients may have seen need a kill notice
        if !(peer.role().carries_avatar() && peer.client_data().is_some()) {
            return;
        }
        for other in mixer.directory.agents() {
            if !mixer.transport.has_active_address(other.id()) {
                continue;
            }
            let packet = OutboundPacket::KillAvatar { avatar_id: id, reason };
            if let Err(e) = mixer.transport.send(other.id(), packet) {
                warn!("Failed to send kill for {} to {}: {}", id, other.id(), e);
            }
        }
    }

    fn retry_purges(&mut self) {
        for purge in &mut self.pending_purges {
            let departed = purge.departed;
            purge.remaining.retain(|peer| !purge_from(peer, departed));
            if !purge.remaining.is_empty() {
                debug!(
                    "{} peers busy while purging {}, retrying next tick",
                    purge.remaining.len(),
                    departed
                );
            }
        }
        self.pending_purges.retain(|purge| !purge.remaining.is_empty());
    }
}

/// Start the broadcast loop background task
pub fn start_broadcast_loop(mut mixer_loop: MixerLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = mixer_loop.mixer().config().clone();
        let mut ticker = interval(config.tick_duration());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Broadcast loop started at {} Hz", config.tick_rate);
        let start = Instant::now();
        let log_every = config.tick_rate as u64 * 30;

        loop {
            ticker.tick().await;
            mixer_loop.tick();

            // Log stats periodically (every 30 seconds)
            if mixer_loop.tick_count() % log_every == 0 {
                let mixer = mixer_loop.mixer();
                info!(
                    "Mixer: {}s, tick {}, {} peers, {} agents | {}",
                    start.elapsed().as_secs(),
                    mixer_loop.tick_count(),
                    mixer.directory().len(),
                    mixer.directory().agents().len(),
                    mixer_loop.throttle().status_message()
                );
            }
        }
    })
}
