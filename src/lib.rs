//! Avatar Mixer Library
//!
//! Relays avatar motion between the clients of a shared virtual space. Every
//! tick each listening agent receives a bandwidth-budgeted batch of the
//! nearest avatars' latest poses, with identities and removals on the side.
//!
//! # Features
//!
//! - `avatar_stats` - Per-avatar entries in the once-per-second stats report (enabled by default)

pub mod avatar;
pub mod config;
pub mod crowd;
pub mod metrics;
pub mod mixer;
pub mod net;
pub mod util;
