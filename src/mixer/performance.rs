//! Global self-throttling
//!
//! Tracks how much of each tick budget the broadcast loop spends idle and
//! turns a sustained lack of slack into a throttling ratio in [0, 1]:
//! - Struggling (trailing sleep below 10%): ratio moves halfway to 1
//! - Recovering (trailing sleep above 20%): ratio steps back down by 0.02
//!
//! Both moves are rate limited to one per `TRAILING_AVERAGE_FRAMES` ticks.
//! The ratio is published through an atomic so other tasks can read it
//! without locking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Window of the trailing sleep average, and minimum ticks between changes
pub const TRAILING_AVERAGE_FRAMES: u32 = 100;

/// Below this trailing sleep ratio the mixer is struggling
pub const STRUGGLE_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD: f32 = 0.10;

/// Above this trailing sleep ratio the mixer may back off throttling
pub const BACK_OFF_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD: f32 = 0.20;

/// Amount the ratio drops per recovery step
const RECOVERY_STEP: f32 = 0.02;

const CURRENT_FRAME_RATIO: f32 = 1.0 / TRAILING_AVERAGE_FRAMES as f32;
const PREVIOUS_FRAMES_RATIO: f32 = 1.0 - CURRENT_FRAME_RATIO;

/// Tick duration samples kept for percentiles (~2 seconds at 60Hz)
const MAX_DURATION_SAMPLES: usize = 120;

/// Direction of a throttle change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThrottleChange {
    Struggling { from: f32, to: f32 },
    Recovering { from: f32, to: f32 },
}

/// Read-only view of the current throttling ratio
#[derive(Debug, Clone, Default)]
pub struct ThrottleHandle {
    bits: Arc<AtomicU32>,
}

impl ThrottleHandle {
    #[inline]
    pub fn ratio(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    fn store(&self, ratio: f32) {
        self.bits.store(ratio.to_bits(), Ordering::Relaxed);
    }
}

/// Tick slack tracker and throttling controller
pub struct PerformanceThrottle {
    tick_budget: Duration,
    trailing_sleep_ratio: f32,
    throttling_ratio: f32,
    frames_since_change: u32,
    handle: ThrottleHandle,
    /// Rolling window of busy time per tick
    tick_durations: VecDeque<Duration>,
    tick_start: Option<Instant>,
}

impl PerformanceThrottle {
    pub fn new(tick_rate: u32) -> Self {
        let tick_budget = Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32);
        Self {
            tick_budget,
            // Start assuming a fully idle server
            trailing_sleep_ratio: 1.0,
            throttling_ratio: 0.0,
            frames_since_change: TRAILING_AVERAGE_FRAMES,
            handle: ThrottleHandle::default(),
            tick_durations: VecDeque::with_capacity(MAX_DURATION_SAMPLES),
            tick_start: None,
        }
    }

    pub fn handle(&self) -> ThrottleHandle {
        self.handle.clone()
    }

    pub fn tick_budget(&self) -> Duration {
        self.tick_budget
    }

    /// Start timing the busy part of a tick
    pub fn tick_start(&mut self) {
        self.tick_start = Some(Instant::now());
    }

    /// Stop timing; the rest of the budget counts as idle. Returns the new ratio.
    pub fn tick_end(&mut self) -> f32 {
        match self.tick_start.take() {
            Some(start) => {
                let busy = start.elapsed();
                self.record_busy(busy);
                self.tick(self.tick_budget.saturating_sub(busy))
            }
            None => self.throttling_ratio,
        }
    }

    fn record_busy(&mut self, busy: Duration) {
        self.tick_durations.push_back(busy);
        while self.tick_durations.len() > MAX_DURATION_SAMPLES {
            self.tick_durations.pop_front();
        }
    }

    /// Feed one tick's idle time and return the throttling ratio
    pub fn tick(&mut self, idle: Duration) -> f32 {
        let sleep_ratio = if self.tick_budget.is_zero() {
            0.0
        } else {
            (idle.as_secs_f32() / self.tick_budget.as_secs_f32()).clamp(0.0, 1.0)
        };

        if let Some(change) = self.update(sleep_ratio) {
            match change {
                ThrottleChange::Struggling { from, to } => info!(
                    "Mixer is struggling, sleeping {:.2}% of frame time. Throttle {:.2} -> {:.2}",
                    self.trailing_sleep_ratio * 100.0,
                    from,
                    to
                ),
                ThrottleChange::Recovering { from, to } => debug!(
                    "Mixer is recovering, sleeping {:.2}% of frame time. Throttle {:.2} -> {:.2}",
                    self.trailing_sleep_ratio * 100.0,
                    from,
                    to
                ),
            }
        }
        self.throttling_ratio
    }

    /// Controller step on a sleep ratio already normalized to [0, 1]
    pub fn update(&mut self, sleep_ratio: f32) -> Option<ThrottleChange> {
        self.trailing_sleep_ratio =
            PREVIOUS_FRAMES_RATIO * self.trailing_sleep_ratio + CURRENT_FRAME_RATIO * sleep_ratio;

        let window_passed = self.frames_since_change >= TRAILING_AVERAGE_FRAMES;
        let from = self.throttling_ratio;

        let change = if window_passed
            && self.trailing_sleep_ratio < STRUGGLE_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD
        {
            self.throttling_ratio += 0.5 * (1.0 - self.throttling_ratio);
            Some(ThrottleChange::Struggling {
                from,
                to: self.throttling_ratio,
            })
        } else if window_passed
            && self.trailing_sleep_ratio > BACK_OFF_TRIGGER_SLEEP_PERCENTAGE_THRESHOLD
            && self.throttling_ratio > 0.0
        {
            self.throttling_ratio = (self.throttling_ratio - RECOVERY_STEP).max(0.0);
            Some(ThrottleChange::Recovering {
                from,
                to: self.throttling_ratio,
            })
        } else {
            None
        };

        match change {
            Some(_) => {
                self.frames_since_change = 0;
                self.handle.store(self.throttling_ratio);
            }
            None => self.frames_since_change = self.frames_since_change.saturating_add(1),
        }
        change
    }

    pub fn throttling_ratio(&self) -> f32 {
        self.throttling_ratio
    }

    pub fn trailing_sleep_ratio(&self) -> f32 {
        self.trailing_sleep_ratio
    }

    /// Trailing idle share of the tick budget, 0-100
    pub fn trailing_sleep_percentage(&self) -> f32 {
        self.trailing_sleep_ratio * 100.0
    }

    pub fn average_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.tick_durations.iter().sum();
        sum / self.tick_durations.len() as u32
    }

    pub fn p95_tick_duration(&self) -> Duration {
        if self.tick_durations.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.tick_durations.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied().unwrap_or(Duration::ZERO)
    }

    /// Busy share of the budget as a percentage (0-100+)
    pub fn budget_usage_percent(&self) -> f32 {
        (self.average_tick_duration().as_secs_f32() / self.tick_budget.as_secs_f32()) * 100.0
    }

    pub fn status_message(&self) -> String {
        format!(
            "throttle {:.2}, sleeping {:.1}%, {:.1}% budget",
            self.throttling_ratio,
            self.trailing_sleep_percentage(),
            self.budget_usage_percent()
        )
    }
}

impl Default for PerformanceThrottle {
    fn default() -> Self {
        Self::new(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_server_never_throttles() {
        let mut throttle = PerformanceThrottle::new(60);
        let budget = throttle.tick_budget();
        for _ in 0..1000 {
            assert_eq!(throttle.tick(budget), 0.0);
        }
        assert!(throttle.trailing_sleep_ratio() > 0.99);
    }

    #[test]
    fn test_busy_server_converges_to_one() {
        let mut throttle = PerformanceThrottle::new(60);
        let mut last = 0.0;
        for _ in 0..3000 {
            let ratio = throttle.tick(Duration::ZERO);
            assert!(ratio >= last);
            assert!(ratio <= 1.0);
            last = ratio;
        }
        assert!(last > 0.99);
        assert_eq!(throttle.handle().ratio(), last);
    }

    #[test]
    fn test_changes_are_rate_limited() {
        let mut throttle = PerformanceThrottle::new(60);
        // Drive trailing sleep below the struggle threshold
        let mut changes = Vec::new();
        for i in 0..1000 {
            if throttle.update(0.0).is_some() {
                changes.push(i);
            }
        }
        assert!(changes.len() >= 2);
        for pair in changes.windows(2) {
            assert!(pair[1] - pair[0] > TRAILING_AVERAGE_FRAMES as usize - 1);
        }
    }

    #[test]
    fn test_recovers_back_to_zero() {
        let mut throttle = PerformanceThrottle::new(60);
        let budget = throttle.tick_budget();
        for _ in 0..3000 {
            throttle.tick(Duration::ZERO);
        }
        assert!(throttle.throttling_ratio() > 0.9);

        let mut last = throttle.throttling_ratio();
        for _ in 0..8000 {
            let ratio = throttle.tick(budget);
            assert!(ratio <= last);
            assert!(ratio >= 0.0);
            last = ratio;
        }
        assert_eq!(last, 0.0);
        assert_eq!(throttle.handle().ratio(), 0.0);
    }

    #[test]
    fn test_struggle_halves_headroom() {
        let mut throttle = PerformanceThrottle::new(60);
        let mut first = None;
        while first.is_none() {
            first = throttle.update(0.0);
        }
        assert_eq!(first, Some(ThrottleChange::Struggling { from: 0.0, to: 0.5 }));
    }

    #[test]
    fn test_between_thresholds_holds() {
        let mut throttle = PerformanceThrottle::new(60);
        for _ in 0..3000 {
            throttle.update(0.0);
        }
        let ratio = throttle.throttling_ratio();
        // Pin the trailing average inside the band
        throttle.trailing_sleep_ratio = 0.15;
        for _ in 0..500 {
            assert!(throttle.update(0.15).is_none());
        }
        assert_eq!(throttle.throttling_ratio(), ratio);
    }

    #[test]
    fn test_tick_timing_records_duration() {
        let mut throttle = PerformanceThrottle::new(60);
        throttle.tick_start();
        std::thread::sleep(Duration::from_millis(1));
        throttle.tick_end();
        assert!(throttle.average_tick_duration() >= Duration::from_millis(1));
        assert!(throttle.p95_tick_duration() >= Duration::from_millis(1));
    }
}
