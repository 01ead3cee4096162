//! Per-window mixer statistics
//!
//! The scheduler reports one `TickCounters` per tick; the aggregator sums
//! them and, once per reporting window (one second of ticks), produces a
//! serializable snapshot and starts over.

use serde::{Deserialize, Serialize};

#[cfg(feature = "avatar_stats")]
use hashbrown::HashMap;

#[cfg(feature = "avatar_stats")]
use crate::net::peer::PeerId;

/// Counters produced by one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickCounters {
    /// Receivers that got a batch this tick
    pub listeners: u64,
    pub identity_packets: u64,
    pub avatars_sent: u64,
    pub held_back: u64,
    pub skipped: u64,
    pub out_of_order: u64,
    /// Receivers or candidates skipped because their lock was busy
    pub mutex_misses: u64,
    pub muted_by_bubble: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

impl TickCounters {
    pub fn accumulate(&mut self, other: &TickCounters) {
        self.listeners += other.listeners;
        self.identity_packets += other.identity_packets;
        self.avatars_sent += other.avatars_sent;
        self.held_back += other.held_back;
        self.skipped += other.skipped;
        self.out_of_order += other.out_of_order;
        self.mutex_misses += other.mutex_misses;
        self.muted_by_bubble += other.muted_by_bubble;
        self.bytes_sent += other.bytes_sent;
        self.send_failures += other.send_failures;
    }
}

/// Figures for one avatar at the end of a window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarStats {
    pub outbound_avatar_data_kbps: f32,
    pub inbound_kbps: f32,
    pub full_rate_distance: f32,
    pub max_avatar_distance: f32,
    pub num_avatars_sent_last_frame: usize,
    pub num_held_back_last_frame: usize,
    pub num_skipped_last_frame: usize,
    pub total_num_out_of_order: u64,
    pub stale_updates_dropped: u64,
    pub muted_by_bubble: usize,
}

/// Report emitted once per window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MixerStatsSnapshot {
    pub frames: u32,
    pub average_listeners_last_second: f32,
    pub average_identity_packets_per_frame: f32,
    pub trailing_sleep_percentage: f32,
    pub performance_throttling_ratio: f32,
    pub peers: usize,
    pub totals: TickCounters,
    #[cfg(feature = "avatar_stats")]
    pub avatars: HashMap<PeerId, AvatarStats>,
}

impl MixerStatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Sums tick counters over a reporting window
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    frames_per_window: u32,
    frames: u32,
    totals: TickCounters,
}

impl StatsAggregator {
    pub fn new(frames_per_window: u32) -> Self {
        Self {
            frames_per_window: frames_per_window.max(1),
            frames: 0,
            totals: TickCounters::default(),
        }
    }

    pub fn record_tick(&mut self, counters: &TickCounters) {
        self.frames += 1;
        self.totals.accumulate(counters);
    }

    /// A full window has been recorded
    pub fn window_complete(&self) -> bool {
        self.frames >= self.frames_per_window
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn totals(&self) -> &TickCounters {
        &self.totals
    }

    /// Build the window report and reset for the next window
    pub fn take_snapshot(
        &mut self,
        trailing_sleep_percentage: f32,
        performance_throttling_ratio: f32,
        peers: usize,
    ) -> MixerStatsSnapshot {
        let frames = self.frames.max(1) as f32;
        let snapshot = MixerStatsSnapshot {
            frames: self.frames,
            average_listeners_last_second: self.totals.listeners as f32 / frames,
            average_identity_packets_per_frame: self.totals.identity_packets as f32 / frames,
            trailing_sleep_percentage,
            performance_throttling_ratio,
            peers,
            totals: self.totals,
            #[cfg(feature = "avatar_stats")]
            avatars: HashMap::new(),
        };
        self.frames = 0;
        self.totals = TickCounters::default();
        snapshot
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(listeners: u64, identity_packets: u64) -> TickCounters {
        TickCounters {
            listeners,
            identity_packets,
            avatars_sent: listeners * 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_window_averages() {
        let mut stats = StatsAggregator::new(4);
        stats.record_tick(&counters(2, 1));
        stats.record_tick(&counters(4, 0));
        assert!(!stats.window_complete());
        stats.record_tick(&counters(2, 3));
        stats.record_tick(&counters(0, 0));
        assert!(stats.window_complete());

        let snapshot = stats.take_snapshot(55.0, 0.25, 3);
        assert_eq!(snapshot.frames, 4);
        assert_eq!(snapshot.average_listeners_last_second, 2.0);
        assert_eq!(snapshot.average_identity_packets_per_frame, 1.0);
        assert_eq!(snapshot.totals.avatars_sent, 16);
        assert_eq!(snapshot.performance_throttling_ratio, 0.25);
    }

    #[test]
    fn test_snapshot_resets_window() {
        let mut stats = StatsAggregator::new(2);
        stats.record_tick(&counters(5, 5));
        stats.record_tick(&counters(5, 5));
        stats.take_snapshot(0.0, 0.0, 0);

        assert_eq!(stats.frames(), 0);
        assert_eq!(*stats.totals(), TickCounters::default());
        assert!(!stats.window_complete());
    }

    #[test]
    fn test_empty_window_does_not_divide_by_zero() {
        let mut stats = StatsAggregator::new(60);
        let snapshot = stats.take_snapshot(100.0, 0.0, 0);
        assert_eq!(snapshot.average_listeners_last_second, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut stats = StatsAggregator::new(1);
        stats.record_tick(&counters(1, 1));
        let json = stats.take_snapshot(12.5, 0.5, 1).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["frames"], 1);
        assert_eq!(value["totals"]["listeners"], 1);
    }
}
