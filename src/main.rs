use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use avatar_mixer::config::MixerConfig;
use avatar_mixer::crowd::{start_crowd, SimulatedCrowd};
use avatar_mixer::metrics::{self, Metrics};
use avatar_mixer::mixer::{start_broadcast_loop, AvatarMixer, MixerLoop};
use avatar_mixer::net::transport::LoopbackTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Avatar Mixer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = MixerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: tick_rate={}, budget={} kbps/peer, scale=[{}, {}]",
        config.tick_rate,
        config.target_kbps_per_peer(),
        config.domain_min_avatar_scale,
        config.domain_max_avatar_scale
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    let metrics_clone = metrics.clone();
    let (bind, port) = (config.bind_address, config.metrics_port);
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, bind, port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let transport = Arc::new(LoopbackTransport::with_history_limit(1));
    let mixer = Arc::new(AvatarMixer::new(config.clone(), transport.clone(), metrics.clone()));

    if config.simulated_avatars > 0 {
        let crowd = SimulatedCrowd::spawn(&mixer, &transport, config.simulated_avatars, rand::random())
            .with_churn(0.01);
        start_crowd(crowd, mixer.clone(), transport.clone(), config.tick_rate);
    }

    let broadcast = start_broadcast_loop(MixerLoop::new(mixer.clone()));
    info!("Mixer ready with {} peers", mixer.directory().len());

    // Shutdown signal handler
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = broadcast => {
            if let Err(e) = result {
                error!("Broadcast loop stopped: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!("Mixer stopped after {} seconds", metrics.uptime_seconds());

    Ok(())
}
