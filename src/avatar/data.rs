//! Server-side copy of one avatar's state
//!
//! Holds the latest pose received from the owning client and the joint
//! snapshot that was last encoded for other clients. Outbound updates are
//! either full (every joint) or delta (only joints that changed since the
//! last completed encoding pass).

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::avatar::identity::AvatarIdentity;
use crate::net::protocol::{encode, EncodeError};
use crate::util::vec3::{Quat, Vec3};

/// Smallest scale any avatar may take, regardless of domain settings
pub const MIN_AVATAR_SCALE: f32 = 0.005;

/// Largest scale any avatar may take, regardless of domain settings
pub const MAX_AVATAR_SCALE: f32 = 1000.0;

/// Joint indices and counts travel as u16
pub const MAX_JOINTS: usize = u16::MAX as usize;

/// Domain-imposed scale limits applied to every incoming pose
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleBounds {
    pub min: f32,
    pub max: f32,
}

impl ScaleBounds {
    /// Caller guarantees `min <= max` (see `MixerConfig::normalize`)
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn clamp(&self, scale: f32) -> f32 {
        scale.clamp(self.min, self.max)
    }
}

impl Default for ScaleBounds {
    fn default() -> Self {
        Self::new(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE)
    }
}

/// One skeleton joint
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct JointData {
    pub rotation: Quat,
    pub translation: Vec3,
}

/// Pose as reported by the owning client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvatarPose {
    pub global_position: Vec3,
    pub orientation: Quat,
    pub target_scale: f32,
    /// Minimum corner of the avatar's global bounding box, if the client sent one
    pub bounding_box_corner: Option<Vec3>,
    pub joints: Vec<JointData>,
}

impl Default for AvatarPose {
    fn default() -> Self {
        Self {
            global_position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            target_scale: 1.0,
            bounding_box_corner: None,
            joints: Vec::new(),
        }
    }
}

/// Outbound payload for one avatar inside a bulk batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvatarUpdate {
    pub global_position: Vec3,
    pub orientation: Quat,
    pub target_scale: f32,
    /// True when every joint is present, false for a delta
    pub full: bool,
    pub joint_count: u16,
    /// (joint index, joint) pairs
    pub joints: Vec<(u16, JointData)>,
}

/// Avatar state owned by the mixer for one connected agent
#[derive(Debug, Clone)]
pub struct AvatarData {
    pose: AvatarPose,
    last_sent_joints: Vec<JointData>,
    identity: Option<AvatarIdentity>,
    scale_bounds: ScaleBounds,
}

impl AvatarData {
    pub fn new(scale_bounds: ScaleBounds) -> Self {
        Self {
            pose: AvatarPose::default(),
            last_sent_joints: Vec::new(),
            identity: None,
            scale_bounds,
        }
    }

    /// Store a pose from the owning client.
    ///
    /// Returns false (and keeps the previous pose) if the position is not
    /// finite or there are more than `MAX_JOINTS` joints.
    pub fn apply_pose(&mut self, mut pose: AvatarPose) -> bool {
        if !pose.global_position.is_finite() {
            warn!("Dropping avatar pose with non-finite position");
            return false;
        }
        if pose.joints.len() > MAX_JOINTS {
            warn!("Dropping avatar pose with {} joints", pose.joints.len());
            return false;
        }
        if let Some(corner) = pose.bounding_box_corner {
            if !corner.is_finite() {
                pose.bounding_box_corner = None;
            }
        }
        pose.target_scale = if pose.target_scale.is_finite() {
            self.scale_bounds.clamp(pose.target_scale)
        } else {
            self.scale_bounds.clamp(1.0)
        };
        self.pose = pose;
        true
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        self.pose.global_position
    }

    #[inline]
    pub fn bounding_box_corner(&self) -> Option<Vec3> {
        self.pose.bounding_box_corner
    }

    #[inline]
    pub fn target_scale(&self) -> f32 {
        self.pose.target_scale
    }

    pub fn pose(&self) -> &AvatarPose {
        &self.pose
    }

    pub fn scale_bounds(&self) -> ScaleBounds {
        self.scale_bounds
    }

    /// Build the outbound update. Delta updates only carry joints that differ
    /// from the snapshot taken by the last `done_encoding`.
    pub fn build_update(&self, send_all: bool) -> AvatarUpdate {
        let joints = self
            .pose
            .joints
            .iter()
            .enumerate()
            .filter(|(i, joint)| send_all || self.last_sent_joints.get(*i) != Some(*joint))
            .map(|(i, joint)| (i as u16, *joint))
            .collect();

        AvatarUpdate {
            global_position: self.pose.global_position,
            orientation: self.pose.orientation,
            target_scale: self.pose.target_scale,
            full: send_all,
            joint_count: self.pose.joints.len() as u16,
            joints,
        }
    }

    pub fn encode_update(&self, send_all: bool) -> Result<Vec<u8>, EncodeError> {
        encode(&self.build_update(send_all))
    }

    /// Everyone has been sent this version of the joints; remember it for deltas.
    pub fn done_encoding(&mut self) {
        self.last_sent_joints.clone_from(&self.pose.joints);
    }

    pub fn identity(&self) -> Option<&AvatarIdentity> {
        self.identity.as_ref()
    }

    /// Store a new identity. Returns true if it differs from the current one.
    pub fn process_identity(&mut self, identity: AvatarIdentity) -> bool {
        if self.identity.as_ref() == Some(&identity) {
            return false;
        }
        self.identity = Some(identity);
        true
    }
}

impl Default for AvatarData {
    fn default() -> Self {
        Self::new(ScaleBounds::default())
    }
}
