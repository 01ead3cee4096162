//! Proximity ignore bubble
//!
//! When either of two avatars has its bubble enabled and their (inflated)
//! bounding boxes touch, each stops receiving the other. The test only reads
//! both avatars' poses, so evaluating it from either side gives the same
//! answer and each receiver only ever writes its own mute set.

use hashbrown::HashSet;

use crate::avatar::data::AvatarData;
use crate::net::peer::PeerId;
use crate::util::aabox::AABox;
use crate::util::vec3::Vec3;

/// Smallest box an avatar occupies for bubble purposes (meters)
pub const MIN_BUBBLE_SIZE: Vec3 = Vec3::new(0.3, 1.3, 0.3);

/// Factor both boxes are grown by before the overlap test
pub const BUBBLE_EXPANSION: f32 = 4.0;

/// Parameters for the bubble test
#[derive(Debug, Clone, Copy)]
pub struct IgnoreBubble {
    min_size: Vec3,
    expansion: f32,
}

impl IgnoreBubble {
    pub fn new(min_size: Vec3, expansion: f32) -> Self {
        Self { min_size, expansion }
    }

    /// Inflated bubble box of an avatar
    pub fn bubble_box(&self, avatar: &AvatarData) -> AABox {
        let position = avatar.position();
        let corner = avatar.bounding_box_corner().unwrap_or(position);
        let mut bubble = AABox::from_center(position, position - corner);
        bubble.clamp_scale_stay_centered(self.min_size);
        bubble.embiggen(self.expansion);
        bubble
    }

    /// Whether two avatars are inside each other's bubble
    pub fn bubbles_touch(&self, a: &AvatarData, b: &AvatarData) -> bool {
        self.bubble_box(a).touches(&self.bubble_box(b))
    }

    /// Decide whether `receiver` should stop hearing `sender`, keeping the
    /// receiver's mute set in step with the answer.
    pub fn should_mute(
        &self,
        bubble_enabled: bool,
        receiver: &AvatarData,
        mute_set: &mut HashSet<PeerId>,
        sender_id: PeerId,
        sender: &AvatarData,
    ) -> bool {
        if bubble_enabled && self.bubbles_touch(receiver, sender) {
            mute_set.insert(sender_id);
            return true;
        }
        mute_set.remove(&sender_id);
        false
    }
}

impl Default for IgnoreBubble {
    fn default() -> Self {
        Self::new(MIN_BUBBLE_SIZE, BUBBLE_EXPANSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avatar::data::AvatarPose;
    use uuid::Uuid;

    fn avatar_at(position: Vec3, corner: Option<Vec3>) -> AvatarData {
        let mut avatar = AvatarData::default();
        avatar.apply_pose(AvatarPose {
            global_position: position,
            bounding_box_corner: corner,
            ..Default::default()
        });
        avatar
    }

    #[test]
    fn test_degenerate_box_uses_minimum_size() {
        let bubble = IgnoreBubble::default();
        let avatar = avatar_at(Vec3::ZERO, None);
        let b = bubble.bubble_box(&avatar);
        assert!(b.scale().approx_eq(MIN_BUBBLE_SIZE * BUBBLE_EXPANSION, 1e-5));
        assert!(b.center().approx_eq(Vec3::ZERO, 1e-5));
    }

    #[test]
    fn test_close_avatars_muted() {
        let bubble = IgnoreBubble::default();
        let receiver = avatar_at(Vec3::ZERO, None);
        // Inflated min boxes reach 0.6m along x on each side
        let sender = avatar_at(Vec3::new(1.0, 0.0, 0.0), None);
        let sender_id = Uuid::new_v4();
        let mut mute_set = HashSet::new();

        assert!(bubble.should_mute(true, &receiver, &mut mute_set, sender_id, &sender));
        assert!(mute_set.contains(&sender_id));
    }

    #[test]
    fn test_far_avatars_unmuted() {
        let bubble = IgnoreBubble::default();
        let receiver = avatar_at(Vec3::ZERO, None);
        let sender = avatar_at(Vec3::new(3.0, 0.0, 0.0), None);
        let sender_id = Uuid::new_v4();
        let mut mute_set = HashSet::new();
        mute_set.insert(sender_id);

        assert!(!bubble.should_mute(true, &receiver, &mut mute_set, sender_id, &sender));
        assert!(!mute_set.contains(&sender_id));
    }

    #[test]
    fn test_disabled_bubble_clears_mute() {
        let bubble = IgnoreBubble::default();
        let receiver = avatar_at(Vec3::ZERO, None);
        let sender = avatar_at(Vec3::ZERO, None);
        let sender_id = Uuid::new_v4();
        let mut mute_set = HashSet::new();
        mute_set.insert(sender_id);

        assert!(!bubble.should_mute(false, &receiver, &mut mute_set, sender_id, &sender));
        assert!(mute_set.is_empty());
    }

    #[test]
    fn test_mute_is_symmetric() {
        let bubble = IgnoreBubble::default();
        let positions = [
            (Vec3::ZERO, Vec3::new(1.1, 0.0, 0.0)),
            (Vec3::ZERO, Vec3::new(1.3, 0.0, 0.0)),
            (Vec3::new(5.0, 1.0, 0.0), Vec3::new(5.0, 6.0, 0.5)),
            (Vec3::ZERO, Vec3::new(0.0, 0.0, 40.0)),
        ];
        for (pa, pb) in positions {
            let a = avatar_at(pa, Some(pa - Vec3::new(0.5, 1.0, 0.5)));
            let b = avatar_at(pb, None);
            let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
            let mut a_mutes = HashSet::new();
            let mut b_mutes = HashSet::new();
            assert_eq!(
                bubble.should_mute(true, &a, &mut a_mutes, b_id, &b),
                bubble.should_mute(true, &b, &mut b_mutes, a_id, &a),
            );
        }
    }

    #[test]
    fn test_bounding_box_corner_grows_bubble() {
        let bubble = IgnoreBubble::default();
        // A 2m-wide avatar reaches far beyond the minimum box
        let wide = avatar_at(Vec3::ZERO, Some(Vec3::new(-1.0, -1.0, -1.0)));
        let other = avatar_at(Vec3::new(4.5, 0.0, 0.0), None);
        assert!(bubble.bubbles_touch(&wide, &other));

        let narrow = avatar_at(Vec3::ZERO, None);
        assert!(!bubble.bubbles_touch(&narrow, &other));
    }
}
