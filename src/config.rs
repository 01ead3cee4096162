use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::avatar::data::{ScaleBounds, MAX_AVATAR_SCALE, MIN_AVATAR_SCALE};

/// Chance per tick of resending an unchanged identity to a receiver
pub const DEFAULT_IDENTITY_SEND_PROBABILITY: f32 = 1.0 / 187.0;

/// Share of avatar sends that carry every joint
pub const DEFAULT_FULL_UPDATE_RATIO: f32 = 0.02;

/// Per-receiver avatar data budget, Mbps
pub const DEFAULT_NODE_SEND_BANDWIDTH_MBPS: f32 = 1.0;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("tick_rate must be at least 1")]
    ZeroTickRate,
    #[error("max_node_send_bandwidth must be positive, got {0}")]
    InvalidBandwidth(f32),
    #[error("metrics_port cannot be 0")]
    ZeroMetricsPort,
}

/// Mixer configuration
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Address the metrics endpoint binds to
    pub bind_address: IpAddr,
    pub metrics_port: u16,
    /// Broadcast ticks per second
    pub tick_rate: u32,
    pub max_node_send_bandwidth_mbps: f32,
    pub domain_min_avatar_scale: f32,
    pub domain_max_avatar_scale: f32,
    pub identity_send_probability: f32,
    pub full_update_ratio: f32,
    /// Wandering avatars driven by the binary (0 = none)
    pub simulated_avatars: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            metrics_port: 9090,
            tick_rate: 60,
            max_node_send_bandwidth_mbps: DEFAULT_NODE_SEND_BANDWIDTH_MBPS,
            domain_min_avatar_scale: MIN_AVATAR_SCALE,
            domain_max_avatar_scale: MAX_AVATAR_SCALE,
            identity_send_probability: DEFAULT_IDENTITY_SEND_PROBABILITY,
            full_update_ratio: DEFAULT_FULL_UPDATE_RATIO,
            simulated_avatars: 0,
        }
    }
}

impl MixerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Invalid values are warned about and
    /// left at their defaults; the result is normalized.
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Some(port) = parse_var::<u16, _>(&lookup, "METRICS_PORT") {
            if port > 0 {
                config.metrics_port = port;
            } else {
                tracing::warn!("METRICS_PORT must be > 0, using default");
            }
        }

        if let Some(rate) = parse_var::<u32, _>(&lookup, "TICK_RATE") {
            if (1..=1000).contains(&rate) {
                config.tick_rate = rate;
            } else {
                tracing::warn!("TICK_RATE must be 1-1000, using default");
            }
        }

        if let Some(mbps) = parse_var::<f32, _>(&lookup, "MAX_NODE_SEND_BANDWIDTH") {
            if mbps.is_finite() && mbps > 0.0 {
                config.max_node_send_bandwidth_mbps = mbps;
            } else {
                tracing::warn!("MAX_NODE_SEND_BANDWIDTH must be positive, using default");
            }
        }

        if let Some(scale) = parse_var::<f32, _>(&lookup, "MIN_AVATAR_SCALE") {
            config.domain_min_avatar_scale = scale;
        }

        if let Some(scale) = parse_var::<f32, _>(&lookup, "MAX_AVATAR_SCALE") {
            config.domain_max_avatar_scale = scale;
        }

        if let Some(p) = parse_var::<f32, _>(&lookup, "IDENTITY_SEND_PROBABILITY") {
            config.identity_send_probability = p;
        }

        if let Some(ratio) = parse_var::<f32, _>(&lookup, "FULL_UPDATE_RATIO") {
            config.full_update_ratio = ratio;
        }

        if let Some(count) = parse_var::<usize, _>(&lookup, "SIMULATED_AVATARS") {
            if count <= 10_000 {
                config.simulated_avatars = count;
            } else {
                tracing::warn!("SIMULATED_AVATARS must be 0-10000, using default");
            }
        }

        config.normalize();
        config
    }

    /// Bring loaded values into range. Inverted scale bounds are swapped.
    pub fn normalize(&mut self) {
        let mut min = finite_or(self.domain_min_avatar_scale, MIN_AVATAR_SCALE)
            .clamp(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE);
        let mut max = finite_or(self.domain_max_avatar_scale, MAX_AVATAR_SCALE)
            .clamp(MIN_AVATAR_SCALE, MAX_AVATAR_SCALE);
        if min > max {
            tracing::warn!(
                "Domain avatar scale bounds are inverted ({} > {}), swapping",
                min,
                max
            );
            std::mem::swap(&mut min, &mut max);
        }
        self.domain_min_avatar_scale = min;
        self.domain_max_avatar_scale = max;

        self.identity_send_probability =
            finite_or(self.identity_send_probability, DEFAULT_IDENTITY_SEND_PROBABILITY).clamp(0.0, 1.0);
        self.full_update_ratio =
            finite_or(self.full_update_ratio, DEFAULT_FULL_UPDATE_RATIO).clamp(0.0, 1.0);
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        let mbps = self.max_node_send_bandwidth_mbps;
        if !(mbps.is_finite() && mbps > 0.0) {
            return Err(ConfigError::InvalidBandwidth(mbps));
        }
        if self.metrics_port == 0 {
            return Err(ConfigError::ZeroMetricsPort);
        }
        Ok(())
    }

    /// Avatar data budget per receiver
    #[inline]
    pub fn target_kbps_per_peer(&self) -> f32 {
        self.max_node_send_bandwidth_mbps * 1000.0
    }

    pub fn scale_bounds(&self) -> ScaleBounds {
        ScaleBounds::new(self.domain_min_avatar_scale, self.domain_max_avatar_scale)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

#[inline]
fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
