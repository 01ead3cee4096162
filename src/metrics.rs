//! Prometheus-compatible metrics endpoint
//!
//! Exposes mixer metrics in Prometheus format, plus the latest per-second
//! stats snapshot as JSON.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::mixer::stats::{MixerStatsSnapshot, TickCounters};

/// Metrics registry for the avatar mixer
#[derive(Debug)]
pub struct Metrics {
    // Peer counts
    pub peers: AtomicU64,
    pub agents: AtomicU64,
    pub disconnects: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Throttle, stored x1000 (e.g. 0.5 = 500)
    pub throttling_ratio_milli: AtomicU64,
    // Trailing sleep, stored x100 (e.g. 85.5% = 8550)
    pub sleep_percent_centi: AtomicU64,

    // Broadcast counters
    pub listeners: AtomicU64,
    pub avatars_sent: AtomicU64,
    pub identity_packets: AtomicU64,
    pub held_back: AtomicU64,
    pub skipped: AtomicU64,
    pub out_of_order: AtomicU64,
    pub mutex_misses: AtomicU64,
    pub muted_by_bubble: AtomicU64,
    pub send_failures: AtomicU64,

    // Network stats
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub stale_updates: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation (VecDeque for O(1) pop_front)
    tick_history: RwLock<VecDeque<u64>>,

    // Last per-window snapshot, already serialized
    latest_stats: RwLock<String>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            peers: AtomicU64::new(0),
            agents: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            throttling_ratio_milli: AtomicU64::new(0),
            sleep_percent_centi: AtomicU64::new(10_000),
            listeners: AtomicU64::new(0),
            avatars_sent: AtomicU64::new(0),
            identity_packets: AtomicU64::new(0),
            held_back: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            mutex_misses: AtomicU64::new(0),
            muted_by_bubble: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            stale_updates: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
            latest_stats: RwLock::new("{}".to_string()),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);

        // Keep last 1000 samples
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Add one tick's broadcast counters to the running totals
    pub fn record_tick(&self, counters: &TickCounters) {
        self.listeners.store(counters.listeners, Ordering::Relaxed);
        self.avatars_sent.fetch_add(counters.avatars_sent, Ordering::Relaxed);
        self.identity_packets.fetch_add(counters.identity_packets, Ordering::Relaxed);
        self.held_back.fetch_add(counters.held_back, Ordering::Relaxed);
        self.skipped.fetch_add(counters.skipped, Ordering::Relaxed);
        self.out_of_order.fetch_add(counters.out_of_order, Ordering::Relaxed);
        self.mutex_misses.fetch_add(counters.mutex_misses, Ordering::Relaxed);
        self.muted_by_bubble.fetch_add(counters.muted_by_bubble, Ordering::Relaxed);
        self.send_failures.fetch_add(counters.send_failures, Ordering::Relaxed);
        self.bytes_sent.fetch_add(counters.bytes_sent, Ordering::Relaxed);
    }

    pub fn set_throttle(&self, ratio: f32, sleep_percentage: f32) {
        self.throttling_ratio_milli
            .store((ratio.clamp(0.0, 1.0) * 1000.0).round() as u64, Ordering::Relaxed);
        self.sleep_percent_centi
            .store((sleep_percentage.clamp(0.0, 100.0) * 100.0).round() as u64, Ordering::Relaxed);
    }

    pub fn throttling_ratio(&self) -> f32 {
        self.throttling_ratio_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn sleep_percentage(&self) -> f32 {
        self.sleep_percent_centi.load(Ordering::Relaxed) as f32 / 100.0
    }

    /// Keep the latest window report for `/stats`
    pub fn publish_stats(&self, snapshot: &MixerStatsSnapshot) {
        *self.latest_stats.write() = snapshot.to_json();
    }

    pub fn latest_stats_json(&self) -> String {
        self.latest_stats.read().clone()
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Peers
        metric!("avatar_mixer_peers", "Connected peers of any role", "gauge",
            self.peers.load(Ordering::Relaxed));
        metric!("avatar_mixer_agents", "Connected avatars", "gauge",
            self.agents.load(Ordering::Relaxed));
        metric!("avatar_mixer_listeners", "Receivers served last tick", "gauge",
            self.listeners.load(Ordering::Relaxed));
        metric!("avatar_mixer_disconnects_total", "Peers removed", "counter",
            self.disconnects.load(Ordering::Relaxed));

        // Performance
        metric!("avatar_mixer_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("avatar_mixer_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("avatar_mixer_throttling_ratio", "Performance throttling ratio (0-1)", "gauge",
            self.throttling_ratio());
        metric!("avatar_mixer_trailing_sleep_percent", "Trailing share of the tick spent idle", "gauge",
            self.sleep_percentage());

        // Broadcast
        metric!("avatar_mixer_avatars_sent_total", "Avatar segments forwarded", "counter",
            self.avatars_sent.load(Ordering::Relaxed));
        metric!("avatar_mixer_identity_packets_total", "Identity packets sent", "counter",
            self.identity_packets.load(Ordering::Relaxed));
        metric!("avatar_mixer_held_back_total", "Sends skipped with nothing new", "counter",
            self.held_back.load(Ordering::Relaxed));
        metric!("avatar_mixer_skipped_total", "Sends with a sequence gap", "counter",
            self.skipped.load(Ordering::Relaxed));
        metric!("avatar_mixer_out_of_order_total", "Out-of-order sequences seen", "counter",
            self.out_of_order.load(Ordering::Relaxed));
        metric!("avatar_mixer_mutex_misses_total", "Peers skipped because their lock was busy", "counter",
            self.mutex_misses.load(Ordering::Relaxed));
        metric!("avatar_mixer_muted_by_bubble_total", "Pairs muted by the ignore bubble", "counter",
            self.muted_by_bubble.load(Ordering::Relaxed));
        metric!("avatar_mixer_send_failures_total", "Packets the transport refused", "counter",
            self.send_failures.load(Ordering::Relaxed));

        // Network
        metric!("avatar_mixer_packets_received_total", "Inbound packets", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("avatar_mixer_bytes_received_total", "Inbound bytes", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("avatar_mixer_bytes_sent_total", "Outbound bytes", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("avatar_mixer_decode_errors_total", "Inbound packets that failed to decode", "counter",
            self.decode_errors.load(Ordering::Relaxed));
        metric!("avatar_mixer_stale_updates_total", "Inbound avatar updates dropped as stale", "counter",
            self.stale_updates.load(Ordering::Relaxed));
        metric!("avatar_mixer_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "peers": {{
    "total": {},
    "agents": {},
    "listeners": {},
    "disconnects": {}
  }},
  "performance": {{
    "tick_time_us": {},
    "tick_time_p95_us": {},
    "tick_time_p99_us": {},
    "tick_time_max_us": {},
    "tick_count": {},
    "throttling_ratio": {},
    "trailing_sleep_percent": {}
  }},
  "broadcast": {{
    "avatars_sent": {},
    "identity_packets": {},
    "held_back": {},
    "skipped": {},
    "out_of_order": {},
    "mutex_misses": {},
    "muted_by_bubble": {},
    "send_failures": {}
  }},
  "network": {{
    "packets_received": {},
    "bytes_received": {},
    "bytes_sent": {},
    "decode_errors": {},
    "stale_updates": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.peers.load(Ordering::Relaxed),
            self.agents.load(Ordering::Relaxed),
            self.listeners.load(Ordering::Relaxed),
            self.disconnects.load(Ordering::Relaxed),
            self.tick_time_us.load(Ordering::Relaxed),
            self.tick_time_p95_us.load(Ordering::Relaxed),
            self.tick_time_p99_us.load(Ordering::Relaxed),
            self.tick_time_max_us.load(Ordering::Relaxed),
            self.tick_count.load(Ordering::Relaxed),
            self.throttling_ratio(),
            self.sleep_percentage(),
            self.avatars_sent.load(Ordering::Relaxed),
            self.identity_packets.load(Ordering::Relaxed),
            self.held_back.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            self.out_of_order.load(Ordering::Relaxed),
            self.mutex_misses.load(Ordering::Relaxed),
            self.muted_by_bubble.load(Ordering::Relaxed),
            self.send_failures.load(Ordering::Relaxed),
            self.packets_received.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.stale_updates.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Response for one request line
fn route(metrics: &Metrics, request: &str) -> String {
    if request.starts_with("GET /metrics/json") {
        http_response("application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        http_response("text/plain; version=0.0.4", &metrics.to_prometheus())
    } else if request.starts_with("GET /stats") {
        http_response("application/json", &metrics.latest_stats_json())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        http_response("text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, bind: IpAddr, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::new(bind, port);
    let listener = TcpListener::bind(addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}
