//! Mixer bookkeeping for one connected avatar
//!
//! Every agent plays two roles each tick: it is a receiver of other avatars
//! (`PeerBroadcastState`) and a sender of its own (`PeerSendState`). Both
//! live behind the peer's single mutex together with the avatar itself.

use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};

use crate::avatar::data::{AvatarData, AvatarPose, ScaleBounds};
use crate::avatar::identity::AvatarIdentity;
use crate::mixer::sequence::{sequence_newer, SequenceNumber};
use crate::mixer::stats::AvatarStats;
use crate::net::peer::PeerId;

/// Full rate distance / max distance sentinel meaning "no limit"
pub const UNBOUNDED_DISTANCE: f32 = f32::MAX;

/// Window for measured data rates
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Byte counter reporting the rate of the last completed window
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    window_start: Option<Instant>,
    bytes_this_window: u64,
    last_kbps: f32,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            bytes_this_window: 0,
            last_kbps: 0.0,
        }
    }

    pub fn record(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.bytes_this_window += bytes as u64;
    }

    /// Kilobits per second over the last completed window
    pub fn kbps(&mut self, now: Instant) -> f32 {
        self.roll(now);
        self.last_kbps
    }

    /// Last computed rate without advancing the window
    pub fn last_kbps(&self) -> f32 {
        self.last_kbps
    }

    fn roll(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.window {
            self.last_kbps = (self.bytes_this_window as f32 * 8.0 / 1000.0) / elapsed.as_secs_f32();
            self.bytes_this_window = 0;
            self.window_start = Some(now);
        }
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

/// This peer as a receiver of other avatars
#[derive(Debug, Clone)]
pub struct PeerBroadcastState {
    /// Last sequence of each sender actually forwarded to this receiver
    pub last_broadcast_sequence: HashMap<PeerId, SequenceNumber>,
    /// Senders whose identity this receiver has been sent at least once
    pub has_received_first_from: HashSet<PeerId>,
    /// Senders currently muted by the ignore bubble
    pub mute_set: HashSet<PeerId>,
    pub full_rate_distance: f32,
    /// Farthest candidate considered on the previous tick
    pub max_avatar_distance: f32,
    pub frames_since_frd_adjustment: u32,
    pub num_avatars_sent_last_frame: usize,
    pub num_held_back_last_frame: usize,
    pub num_skipped_last_frame: usize,
    pub num_out_of_order_last_frame: usize,
    /// Out-of-order sequences seen by this receiver since it connected
    pub total_num_out_of_order: u64,
    avatar_data_meter: RateMeter,
}

impl PeerBroadcastState {
    /// 0 for a sender never forwarded to this receiver
    pub fn last_broadcast_sequence(&self, sender: PeerId) -> SequenceNumber {
        self.last_broadcast_sequence.get(&sender).copied().unwrap_or(0)
    }

    pub fn set_last_broadcast_sequence(&mut self, sender: PeerId, sequence: SequenceNumber) {
        self.last_broadcast_sequence.insert(sender, sequence);
    }

    /// Marks first contact with `sender`. Returns true if it had already happened.
    pub fn check_and_set_has_received_first_from(&mut self, sender: PeerId) -> bool {
        !self.has_received_first_from.insert(sender)
    }

    pub fn reset_frame_stats(&mut self) {
        self.num_avatars_sent_last_frame = 0;
        self.num_held_back_last_frame = 0;
        self.num_skipped_last_frame = 0;
        self.num_out_of_order_last_frame = 0;
    }

    pub fn record_sent_avatar_data(&mut self, bytes: usize, now: Instant) {
        self.avatar_data_meter.record(bytes, now);
    }

    pub fn avatar_data_kbps(&mut self, now: Instant) -> f32 {
        self.avatar_data_meter.kbps(now)
    }

    pub fn last_avatar_data_kbps(&self) -> f32 {
        self.avatar_data_meter.last_kbps()
    }

    /// Drop everything remembered about `peer`
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.last_broadcast_sequence.remove(&peer);
        self.has_received_first_from.remove(&peer);
        self.mute_set.remove(&peer);
    }
}

impl Default for PeerBroadcastState {
    fn default() -> Self {
        Self {
            last_broadcast_sequence: HashMap::new(),
            has_received_first_from: HashSet::new(),
            mute_set: HashSet::new(),
            full_rate_distance: UNBOUNDED_DISTANCE,
            max_avatar_distance: UNBOUNDED_DISTANCE,
            frames_since_frd_adjustment: 0,
            num_avatars_sent_last_frame: 0,
            num_held_back_last_frame: 0,
            num_skipped_last_frame: 0,
            num_out_of_order_last_frame: 0,
            total_num_out_of_order: 0,
            avatar_data_meter: RateMeter::default(),
        }
    }
}

/// This peer as a sender of its own avatar
#[derive(Debug, Clone, Default)]
pub struct PeerSendState {
    /// Latest sequence number received from this peer's client
    pub last_received_sequence: SequenceNumber,
    has_received_any: bool,
    /// When the identity last changed, if it was ever set
    pub identity_change_timestamp: Option<Instant>,
    /// Inbound updates older than the current one, ignored
    pub num_stale_updates_dropped: u64,
    inbound_meter: RateMeter,
}

impl PeerSendState {
    /// Not newer than the update already held
    pub fn is_stale(&self, sequence: SequenceNumber) -> bool {
        self.has_received_any && !sequence_newer(sequence, self.last_received_sequence)
    }

    pub fn record_sequence(&mut self, sequence: SequenceNumber) {
        self.has_received_any = true;
        self.last_received_sequence = sequence;
    }

    pub fn has_received_any(&self) -> bool {
        self.has_received_any
    }

    pub fn flag_identity_change(&mut self, now: Instant) {
        self.identity_change_timestamp = Some(now);
    }

    pub fn inbound_kbps(&mut self, now: Instant) -> f32 {
        self.inbound_meter.kbps(now)
    }
}

/// Everything the mixer keeps for one agent, guarded by one mutex
#[derive(Debug, Clone)]
pub struct AvatarClientData {
    pub avatar: AvatarData,
    pub broadcast: PeerBroadcastState,
    pub send: PeerSendState,
}

impl AvatarClientData {
    pub fn new(scale_bounds: ScaleBounds) -> Self {
        Self {
            avatar: AvatarData::new(scale_bounds),
            broadcast: PeerBroadcastState::default(),
            send: PeerSendState::default(),
        }
    }

    /// Ingest an avatar data packet. Returns false if it was stale or invalid.
    pub fn apply_avatar_update(
        &mut self,
        sequence: SequenceNumber,
        pose: AvatarPose,
        packet_bytes: usize,
        now: Instant,
    ) -> bool {
        self.send.inbound_meter.record(packet_bytes, now);
        if self.send.is_stale(sequence) {
            self.send.num_stale_updates_dropped += 1;
            return false;
        }
        if !self.avatar.apply_pose(pose) {
            return false;
        }
        self.send.record_sequence(sequence);
        true
    }

    /// Ingest an identity packet. Returns true if the identity changed.
    pub fn apply_identity(&mut self, identity: AvatarIdentity, now: Instant) -> bool {
        if self.avatar.process_identity(identity) {
            self.send.flag_identity_change(now);
            true
        } else {
            false
        }
    }

    pub fn forget_peer(&mut self, peer: PeerId) {
        self.broadcast.forget_peer(peer);
    }

    /// Per-avatar figures for the stats report
    pub fn stats(&mut self, now: Instant) -> AvatarStats {
        AvatarStats {
            outbound_avatar_data_kbps: self.broadcast.avatar_data_kbps(now),
            inbound_kbps: self.send.inbound_kbps(now),
            full_rate_distance: self.broadcast.full_rate_distance,
            max_avatar_distance: self.broadcast.max_avatar_distance,
            num_avatars_sent_last_frame: self.broadcast.num_avatars_sent_last_frame,
            num_held_back_last_frame: self.broadcast.num_held_back_last_frame,
            num_skipped_last_frame: self.broadcast.num_skipped_last_frame,
            total_num_out_of_order: self.broadcast.total_num_out_of_order,
            stale_updates_dropped: self.send.num_stale_updates_dropped,
            muted_by_bubble: self.broadcast.mute_set.len(),
        }
    }
}
