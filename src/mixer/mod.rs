pub mod broadcast;
pub mod bubble;
pub mod client_data;
pub mod events;
pub mod performance;
pub mod rate_control;
pub mod sequence;
pub mod session;
pub mod stats;

pub use broadcast::{BroadcastScheduler, BroadcastSettings};
pub use session::{start_broadcast_loop, AvatarMixer, MixerError, MixerLoop};
