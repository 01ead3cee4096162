//! Per-receiver bandwidth control
//!
//! Every receiver has a full rate distance (FRD): senders closer than it are
//! always forwarded, senders further away are forwarded with probability
//! `FRD / distance`. About once a second the FRD is rescaled so the avatar
//! data rate measured for that receiver moves toward the configured budget.
//!
//! Rescaling targets the middle of a hysteresis band (80%..100% of the
//! budget) rather than its edge, so a correction does not immediately trigger
//! the opposite one on the next pass.

use crate::mixer::client_data::{PeerBroadcastState, UNBOUNDED_DISTANCE};

/// Below this fraction of the budget a distance-limited receiver may grow its FRD
pub const FRD_ADJUSTMENT_ACCEPTABLE_RATIO: f32 = 0.8;

/// Width of the hysteresis band as a fraction of the budget
const HYSTERESIS_GAP: f32 = 1.0 - FRD_ADJUSTMENT_ACCEPTABLE_RATIO;

/// Fraction of the budget the rescale aims for (middle of the band)
pub const HYSTERESIS_MIDDLE_PERCENTAGE: f32 = 1.0 - HYSTERESIS_GAP * 0.5;

/// Result of one controller evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrdAdjustment {
    /// Over budget; FRD shrunk to the contained value
    Decreased(f32),
    /// Under budget while distance-limited; FRD grown to the contained value
    Increased(f32),
    Unchanged,
}

impl FrdAdjustment {
    pub fn new_frd(&self) -> Option<f32> {
        match self {
            FrdAdjustment::Decreased(frd) | FrdAdjustment::Increased(frd) => Some(*frd),
            FrdAdjustment::Unchanged => None,
        }
    }
}

/// Drives each receiver's FRD toward the shared bandwidth budget
#[derive(Debug, Clone)]
pub struct RateController {
    target_kbps: f32,
    /// Ticks between evaluations (the tick rate, i.e. once a second)
    frames_between_adjustments: u32,
}

impl RateController {
    pub fn new(target_kbps: f32, frames_between_adjustments: u32) -> Self {
        Self {
            target_kbps,
            frames_between_adjustments,
        }
    }

    pub fn target_kbps(&self) -> f32 {
        self.target_kbps
    }

    /// Scale factor that would bring `observed_kbps` to the middle of the band
    #[inline]
    fn midpoint_ratio(&self, observed_kbps: f32) -> f32 {
        (self.target_kbps * HYSTERESIS_MIDDLE_PERCENTAGE) / observed_kbps
    }

    /// Pure controller step.
    ///
    /// Never returns a negative FRD, and never grows FRD while over budget.
    pub fn adjust_frd(
        &self,
        observed_kbps: f32,
        current_frd: f32,
        max_observed_distance: f32,
    ) -> FrdAdjustment {
        if observed_kbps > self.target_kbps {
            // No point targeting a distance beyond the farthest avatar
            let clamped = current_frd.min(max_observed_distance);
            let scaled = clamped * self.midpoint_ratio(observed_kbps);
            FrdAdjustment::Decreased(scaled.max(0.0))
        } else if current_frd < max_observed_distance
            && observed_kbps < self.target_kbps * FRD_ADJUSTMENT_ACCEPTABLE_RATIO
        {
            if observed_kbps <= 0.0 {
                // Nothing measured at all: stop limiting
                return FrdAdjustment::Increased(UNBOUNDED_DISTANCE);
            }
            let scaled = current_frd * self.midpoint_ratio(observed_kbps);
            FrdAdjustment::Increased(scaled.clamp(0.0, UNBOUNDED_DISTANCE))
        } else {
            FrdAdjustment::Unchanged
        }
    }

    /// Amortized step for one receiver: evaluates only once more than
    /// `frames_between_adjustments` ticks have passed since the last change.
    pub fn maybe_adjust(&self, state: &mut PeerBroadcastState, observed_kbps: f32) -> FrdAdjustment {
        if state.frames_since_frd_adjustment <= self.frames_between_adjustments {
            state.frames_since_frd_adjustment += 1;
            return FrdAdjustment::Unchanged;
        }

        let adjustment = self.adjust_frd(
            observed_kbps,
            state.full_rate_distance,
            state.max_avatar_distance,
        );

        match adjustment.new_frd() {
            Some(frd) => {
                state.full_rate_distance = frd;
                state.frames_since_frd_adjustment = 0;
            }
            None => {
                state.frames_since_frd_adjustment =
                    state.frames_since_frd_adjustment.saturating_add(1);
            }
        }
        adjustment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RateController {
        RateController::new(100.0, 60)
    }

    #[test]
    fn test_over_budget_shrinks_below_max_distance() {
        // 200 kbps against a 100 kbps budget, FRD 50, farthest avatar at 40
        let result = controller().adjust_frd(200.0, 50.0, 40.0);
        let frd = result.new_frd().unwrap();
        assert!(matches!(result, FrdAdjustment::Decreased(_)));
        assert!(frd <= 40.0);
        assert!(frd < 50.0);
        // 40 * (100 * 0.9) / 200
        assert!((frd - 18.0).abs() < 1e-4);
    }

    #[test]
    fn test_under_budget_grows_when_distance_limited() {
        let result = controller().adjust_frd(45.0, 10.0, 40.0);
        assert!(matches!(result, FrdAdjustment::Increased(_)));
        // 10 * 90 / 45
        let frd = result.new_frd().unwrap();
        assert!((frd - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_within_band_unchanged() {
        assert_eq!(controller().adjust_frd(85.0, 10.0, 40.0), FrdAdjustment::Unchanged);
    }

    #[test]
    fn test_not_distance_limited_unchanged() {
        // Already reaching everyone
        assert_eq!(controller().adjust_frd(10.0, 50.0, 40.0), FrdAdjustment::Unchanged);
    }

    #[test]
    fn test_zero_rate_unbounds() {
        assert_eq!(
            controller().adjust_frd(0.0, 10.0, 40.0),
            FrdAdjustment::Increased(UNBOUNDED_DISTANCE)
        );
    }

    #[test]
    fn test_never_negative_never_grows_over_budget() {
        let c = controller();
        for observed in [100.5, 150.0, 1_000.0, 1e9] {
            for frd in [0.0, 1.0, 37.5, UNBOUNDED_DISTANCE] {
                for max in [0.0, 5.0, 400.0, UNBOUNDED_DISTANCE] {
                    let new = c.adjust_frd(observed, frd, max).new_frd().unwrap();
                    assert!(new >= 0.0);
                    assert!(new <= frd);
                }
            }
        }
    }

    #[test]
    fn test_amortized_once_per_window() {
        let c = controller();
        let mut state = PeerBroadcastState::default();
        state.full_rate_distance = 50.0;
        state.max_avatar_distance = 40.0;

        for _ in 0..=60 {
            assert_eq!(c.maybe_adjust(&mut state, 200.0), FrdAdjustment::Unchanged);
        }
        assert!(matches!(c.maybe_adjust(&mut state, 200.0), FrdAdjustment::Decreased(_)));
        assert_eq!(state.frames_since_frd_adjustment, 0);
        assert!(state.full_rate_distance < 50.0);

        // Next call is inside the new window
        assert_eq!(c.maybe_adjust(&mut state, 200.0), FrdAdjustment::Unchanged);
    }

    #[test]
    fn test_converges_into_band() {
        // Rate proportional to FRD: 4 kbps per meter
        let c = controller();
        let mut frd = 100.0_f32;
        let max = 200.0;
        for _ in 0..20 {
            let observed = frd * 4.0;
            if let Some(new) = c.adjust_frd(observed, frd, max).new_frd() {
                frd = new;
            }
        }
        let observed = frd * 4.0;
        assert!(observed <= 100.0);
        assert!(observed >= 80.0);
    }
}
