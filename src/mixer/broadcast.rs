//! One fan-out pass over every connected avatar
//!
//! For each receiver the scheduler walks every other avatar and decides
//! whether to forward it this tick:
//! 1. Explicit ignores and the proximity bubble
//! 2. Amortized identity sends
//! 3. Distance admission against the receiver's full rate distance
//! 4. Sequence dedup (held back / gap / normal)
//!
//! Admitted avatars are appended to one batch per receiver. Every lock is
//! taken with `try_lock`: a busy receiver or sender is left out of this tick
//! and counted as a mutex miss. The tick never waits.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::MixerConfig;
use crate::mixer::bubble::IgnoreBubble;
use crate::mixer::client_data::{AvatarClientData, UNBOUNDED_DISTANCE};
use crate::mixer::rate_control::RateController;
use crate::mixer::sequence::{classify, SequenceClass};
use crate::mixer::stats::TickCounters;
use crate::net::peer::Peer;
use crate::net::protocol::{AvatarBatch, OutboundPacket};
use crate::net::transport::Transport;

/// Tunables read once at startup
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSettings {
    /// Avatar data budget per receiver
    pub target_kbps: f32,
    pub tick_rate: u32,
    /// Chance per tick and pair of resending an unchanged identity
    pub identity_send_probability: f32,
    /// Share of sends that carry every joint rather than a delta
    pub full_update_ratio: f32,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self::from(&MixerConfig::default())
    }
}

impl From<&MixerConfig> for BroadcastSettings {
    fn from(config: &MixerConfig) -> Self {
        Self {
            target_kbps: config.target_kbps_per_peer(),
            tick_rate: config.tick_rate,
            identity_send_probability: config.identity_send_probability,
            full_update_ratio: config.full_update_ratio,
        }
    }
}

/// Runs broadcast ticks
pub struct BroadcastScheduler {
    settings: BroadcastSettings,
    rate: RateController,
    bubble: IgnoreBubble,
    rng: StdRng,
    /// Start of the previous tick, for "identity changed since" checks
    last_frame_timestamp: Option<Instant>,
}

impl BroadcastScheduler {
    pub fn new(settings: BroadcastSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    /// Deterministic scheduler for tests and benchmarks
    pub fn with_seed(settings: BroadcastSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: BroadcastSettings, rng: StdRng) -> Self {
        Self {
            rate: RateController::new(settings.target_kbps, settings.tick_rate),
            bubble: IgnoreBubble::default(),
            settings,
            rng,
            last_frame_timestamp: None,
        }
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    pub fn rate_controller(&self) -> &RateController {
        &self.rate
    }

    pub fn run_tick(&mut self, peers: &[Arc<Peer>], transport: &dyn Transport) -> TickCounters {
        self.run_tick_at(peers, transport, Instant::now())
    }

    /// One full pass at time `now`
    pub fn run_tick_at(
        &mut self,
        peers: &[Arc<Peer>],
        transport: &dyn Transport,
        now: Instant,
    ) -> TickCounters {
        let mut counters = TickCounters::default();

        for receiver in peers {
            self.broadcast_to(receiver, peers, transport, now, &mut counters);
        }

        // Everyone has seen this tick's joints: deltas restart from here
        for peer in peers {
            if let Some(data) = peer.client_data() {
                match data.try_lock() {
                    Some(mut data) => data.avatar.done_encoding(),
                    None => debug!("Skipping done-encoding for busy avatar {}", peer.id()),
                }
            }
        }

        self.last_frame_timestamp = Some(now);
        counters
    }

    fn broadcast_to(
        &mut self,
        receiver: &Arc<Peer>,
        peers: &[Arc<Peer>],
        transport: &dyn Transport,
        now: Instant,
        counters: &mut TickCounters,
    ) {
        if !receiver.role().carries_avatar() || !transport.has_active_address(receiver.id()) {
            return;
        }
        let Some(receiver_data) = receiver.client_data() else {
            return;
        };
        let Some(mut receiver_guard) = receiver_data.try_lock() else {
            counters.mutex_misses += 1;
            return;
        };
        let r: &mut AvatarClientData = &mut receiver_guard;

        r.broadcast.reset_frame_stats();
        let observed_kbps = r.broadcast.avatar_data_kbps(now);
        let adjustment = self.rate.maybe_adjust(&mut r.broadcast, observed_kbps);
        if let Some(frd) = adjustment.new_frd() {
            debug!(
                "Receiver {} at {:.1} kbps: full rate distance -> {}",
                receiver.id(),
                observed_kbps,
                frd
            );
        }

        let frd = r.broadcast.full_rate_distance;
        let receiver_position = r.avatar.position();
        let receiver_bubble = receiver.is_ignore_radius_enabled();

        let mut batch = AvatarBatch::new();
        let mut identity_packets = Vec::new();
        let mut max_distance: Option<f32> = None;

        for sender in peers {
            let sender_id = sender.id();
            if sender_id == receiver.id()
                || !sender.role().carries_avatar()
                || !transport.has_active_address(sender_id)
            {
                continue;
            }
            let Some(sender_data) = sender.client_data() else {
                continue;
            };

            match (
                receiver.try_is_ignoring(sender_id),
                sender.try_is_ignoring(receiver.id()),
            ) {
                (Some(false), Some(false)) => {}
                (Some(_), Some(_)) => continue,
                _ => {
                    counters.mutex_misses += 1;
                    continue;
                }
            }

            let Some(s) = sender_data.try_lock() else {
                counters.mutex_misses += 1;
                continue;
            };

            let bubble_enabled = receiver_bubble || sender.is_ignore_radius_enabled();
            if self.bubble.should_mute(
                bubble_enabled,
                &r.avatar,
                &mut r.broadcast.mute_set,
                sender_id,
                &s.avatar,
            ) {
                counters.muted_by_bubble += 1;
                continue;
            }

            if let Some(identity) = s.avatar.identity() {
                let first_contact = !r.broadcast.check_and_set_has_received_first_from(sender_id);
                let changed = match (s.send.identity_change_timestamp, self.last_frame_timestamp) {
                    (Some(changed_at), Some(last_frame)) => changed_at > last_frame,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if first_contact
                    || changed
                    || self.rng.gen::<f32>() < self.settings.identity_send_probability
                {
                    identity_packets.push(OutboundPacket::AvatarIdentity {
                        avatar_id: sender_id,
                        identity: identity.clone(),
                    });
                }
            }

            let distance = receiver_position.distance_to(s.avatar.position());
            max_distance = Some(max_distance.map_or(distance, |max| max.max(distance)));

            let admitted = distance == 0.0 || self.rng.gen::<f32>() <= frd / distance;
            if !admitted {
                continue;
            }

            let last_sent = r.broadcast.last_broadcast_sequence(sender_id);
            let produced = s.send.last_received_sequence;
            let decision = classify(last_sent, produced);
            if decision.out_of_order {
                r.broadcast.num_out_of_order_last_frame += 1;
                r.broadcast.total_num_out_of_order += 1;
                counters.out_of_order += 1;
            }
            match decision.class {
                SequenceClass::HeldBack => {
                    r.broadcast.num_held_back_last_frame += 1;
                    counters.held_back += 1;
                    continue;
                }
                SequenceClass::Gap => {
                    r.broadcast.num_skipped_last_frame += 1;
                    counters.skipped += 1;
                }
                SequenceClass::Normal => {}
            }

            // A receiver's first copy of an avatar is always complete
            let first_send = !r.broadcast.last_broadcast_sequence.contains_key(&sender_id);
            let send_all = first_send || self.rng.gen::<f32>() < self.settings.full_update_ratio;
            match s.avatar.encode_update(send_all) {
                Ok(payload) => {
                    batch.push(sender_id, payload);
                    r.broadcast.set_last_broadcast_sequence(sender_id, produced);
                    r.broadcast.num_avatars_sent_last_frame += 1;
                }
                Err(e) => warn!("Failed to encode avatar {}: {}", sender_id, e),
            }
        }

        match max_distance {
            Some(max) => r.broadcast.max_avatar_distance = max,
            None => {
                // Nobody visible: re-admit everyone next tick
                r.broadcast.max_avatar_distance = UNBOUNDED_DISTANCE;
                r.broadcast.full_rate_distance = UNBOUNDED_DISTANCE;
            }
        }

        counters.identity_packets += identity_packets.len() as u64;
        for packet in identity_packets {
            match transport.send(receiver.id(), packet) {
                Ok(bytes) => counters.bytes_sent += bytes as u64,
                Err(e) => {
                    counters.send_failures += 1;
                    warn!("Failed to send identity to {}: {}", receiver.id(), e);
                }
            }
        }

        counters.avatars_sent += batch.len() as u64;
        if !batch.is_empty() {
            match transport.send(receiver.id(), OutboundPacket::BulkAvatarData(batch)) {
                Ok(bytes) => {
                    r.broadcast.record_sent_avatar_data(bytes, now);
                    counters.bytes_sent += bytes as u64;
                }
                Err(e) => {
                    counters.send_failures += 1;
                    warn!("Failed to send avatar data to {}: {}", receiver.id(), e);
                }
            }
        }
        counters.listeners += 1;
    }
}
