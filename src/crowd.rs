//! Simulated crowd
//!
//! Wandering avatars that feed the mixer through the same ingestion path as
//! real clients: encoded packets into `AvatarMixer::handle_packet`. Used by
//! the binary when `SIMULATED_AVATARS` is set and by the benchmarks.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::avatar::data::{AvatarPose, JointData};
use crate::avatar::identity::AvatarIdentity;
use crate::mixer::session::AvatarMixer;
use crate::net::peer::{PeerId, PeerRole, SessionKey};
use crate::net::protocol::{encode, InboundPacket};
use crate::net::transport::LoopbackTransport;
use crate::util::vec3::{Quat, Vec3};

/// Avatars stay inside this radius around the origin (meters)
pub const CROWD_RADIUS: f32 = 60.0;

/// Joints animated per avatar
const JOINT_COUNT: usize = 24;

/// Seconds between heading changes
const DECISION_INTERVAL: f32 = 3.0;

/// How each avatar moves
#[derive(Debug, Clone)]
pub struct WanderPersonality {
    /// Meters per second
    pub speed: f32,
    /// Chance of turning on the ignore bubble
    pub shy: bool,
}

impl WanderPersonality {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self {
            speed: rng.gen_range(0.5..2.5),
            shy: rng.gen_bool(0.2),
        }
    }
}

#[derive(Debug)]
struct SimulatedAvatar {
    id: PeerId,
    session: SessionKey,
    position: Vec3,
    heading: Vec3,
    decision_timer: f32,
    sequence: u16,
    phase: f32,
    personality: WanderPersonality,
}

/// A group of simulated avatars
pub struct SimulatedCrowd {
    avatars: Vec<SimulatedAvatar>,
    rng: StdRng,
    /// Chance per step that one avatar leaves and a new one joins
    churn_probability: f64,
    next_port: u16,
}

impl SimulatedCrowd {
    pub fn new(seed: u64) -> Self {
        Self {
            avatars: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            churn_probability: 0.0,
            next_port: 40_000,
        }
    }

    /// Connect `count` avatars to the mixer
    pub fn spawn(mixer: &AvatarMixer, transport: &LoopbackTransport, count: usize, seed: u64) -> Self {
        let mut crowd = Self::new(seed);
        for _ in 0..count {
            crowd.join(mixer, transport);
        }
        crowd
    }

    pub fn with_churn(mut self, probability: f64) -> Self {
        self.churn_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.avatars.iter().map(|a| a.id).collect()
    }

    fn join(&mut self, mixer: &AvatarMixer, transport: &LoopbackTransport) {
        let id = Uuid::new_v4();
        let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let radius = self.rng.gen_range(0.0..CROWD_RADIUS);
        let personality = WanderPersonality::random(&mut self.rng);

        let peer = mixer.add_peer(id, PeerRole::Agent);
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.next_port);
        self.next_port = self.next_port.checked_add(1).unwrap_or(40_000);
        transport.set_address(id, Some(address));
        peer.set_ignore_radius_enabled(personality.shy);

        let name = format!("Wanderer{}", self.rng.gen_range(1000..9999));
        send(mixer, id, &InboundPacket::AvatarIdentity(AvatarIdentity::new(name)));

        self.avatars.push(SimulatedAvatar {
            id,
            session: peer.session_key(),
            position: Vec3::new(angle.cos() * radius, 0.0, angle.sin() * radius),
            heading: Vec3::ZERO,
            decision_timer: 0.0,
            sequence: 0,
            phase: self.rng.gen_range(0.0..std::f32::consts::TAU),
            personality,
        });
    }

    fn leave(&mut self, mixer: &AvatarMixer, transport: &LoopbackTransport) {
        if self.avatars.is_empty() {
            return;
        }
        let index = self.rng.gen_range(0..self.avatars.len());
        let avatar = self.avatars.swap_remove(index);
        mixer.peer_disconnected(avatar.session);
        transport.forget(avatar.id);
        debug!("Simulated avatar {} left", avatar.id);
    }

    /// Advance every avatar by `dt` seconds and send its new pose
    pub fn step(&mut self, mixer: &AvatarMixer, transport: &LoopbackTransport, dt: f32) {
        if self.churn_probability > 0.0 && self.rng.gen_bool(self.churn_probability) {
            self.leave(mixer, transport);
            self.join(mixer, transport);
        }

        for avatar in &mut self.avatars {
            avatar.decision_timer -= dt;
            if avatar.decision_timer <= 0.0 {
                let angle = self.rng.gen_range(0.0..std::f32::consts::TAU);
                avatar.heading = Vec3::new(angle.cos(), 0.0, angle.sin());
                avatar.decision_timer = DECISION_INTERVAL * (1.0 + self.rng.gen_range(-0.2..0.2));
            }

            avatar.position = avatar.position + avatar.heading * (avatar.personality.speed * dt);
            // Turn back toward the middle at the edge
            if avatar.position.length() > CROWD_RADIUS {
                avatar.heading = (-avatar.position).normalize();
            }
            avatar.phase += dt;
            avatar.sequence = avatar.sequence.wrapping_add(1);

            let packet = InboundPacket::AvatarData {
                sequence: avatar.sequence,
                pose: pose_for(avatar),
            };
            send(mixer, avatar.id, &packet);
        }
    }
}

fn pose_for(avatar: &SimulatedAvatar) -> AvatarPose {
    let joints = (0..JOINT_COUNT)
        .map(|i| {
            // Only a few limbs swing; the rest stay still between deltas
            let swing = if i % 6 == 0 { (avatar.phase * 2.0).sin() * 0.5 } else { 0.0 };
            JointData {
                rotation: Quat::from_axis_angle(Vec3::UP, swing),
                translation: Vec3::new(0.0, i as f32 * 0.07, 0.0),
            }
        })
        .collect();

    AvatarPose {
        global_position: avatar.position,
        orientation: Quat::from_axis_angle(Vec3::UP, avatar.heading.x.atan2(avatar.heading.z)),
        target_scale: 1.0,
        bounding_box_corner: Some(avatar.position - Vec3::new(0.25, 0.0, 0.25)),
        joints,
    }
}

fn send(mixer: &AvatarMixer, id: PeerId, packet: &InboundPacket) {
    match encode(packet) {
        Ok(bytes) => {
            if let Err(e) = mixer.handle_packet(id, &bytes) {
                warn!("Simulated avatar {} rejected: {}", id, e);
            }
        }
        Err(e) => warn!("Failed to encode simulated packet: {}", e),
    }
}

/// Drive the crowd at `update_rate` Hz in the background
pub fn start_crowd(
    mut crowd: SimulatedCrowd,
    mixer: Arc<AvatarMixer>,
    transport: Arc<LoopbackTransport>,
    update_rate: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f32(1.0 / update_rate.max(1) as f32);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Simulated crowd of {} avatars at {} Hz", crowd.len(), update_rate);

        loop {
            ticker.tick().await;
            crowd.step(&mixer, &transport, period.as_secs_f32());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MixerConfig;
    use crate::metrics::Metrics;

    fn mixer() -> (Arc<LoopbackTransport>, AvatarMixer) {
        let transport = Arc::new(LoopbackTransport::new());
        let mixer = AvatarMixer::new(MixerConfig::default(), transport.clone(), Arc::new(Metrics::new()));
        (transport, mixer)
    }

    #[test]
    fn test_spawn_registers_agents() {
        let (transport, mixer) = mixer();
        let crowd = SimulatedCrowd::spawn(&mixer, &transport, 5, 1);

        assert_eq!(crowd.len(), 5);
        assert_eq!(mixer.directory().agents().len(), 5);
        for id in crowd.ids() {
            let peer = mixer.directory().get(id).unwrap();
            let data = peer.client_data().unwrap().lock();
            assert!(data.avatar.identity().is_some());
        }
    }

    #[test]
    fn test_step_sends_fresh_sequences() {
        let (transport, mixer) = mixer();
        let mut crowd = SimulatedCrowd::spawn(&mixer, &transport, 3, 2);
        for _ in 0..10 {
            crowd.step(&mixer, &transport, 1.0 / 60.0);
        }

        for id in crowd.ids() {
            let peer = mixer.directory().get(id).unwrap();
            let data = peer.client_data().unwrap().lock();
            assert_eq!(data.send.last_received_sequence, 10);
            assert_eq!(data.avatar.pose().joints.len(), JOINT_COUNT);
            assert!(data.avatar.position().length() <= CROWD_RADIUS + 1.0);
        }
    }

    #[test]
    fn test_churn_replaces_avatars() {
        let (transport, mixer) = mixer();
        let mut crowd = SimulatedCrowd::spawn(&mixer, &transport, 4, 3).with_churn(1.0);
        let before = crowd.ids();
        crowd.step(&mixer, &transport, 1.0 / 60.0);

        assert_eq!(crowd.len(), 4);
        assert_ne!(crowd.ids(), before);
        // Five peers until the loop applies the queued disconnect
        assert_eq!(mixer.directory().len(), 5);
    }
}
