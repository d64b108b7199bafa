//! Conference Bridge
//!
//! Binds the RTP socket, starts the mixing schedulers and serves the
//! control API until interrupted.
//!
//! Usage: `bridge [config.toml]`

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conference_bridge::{
    conference::{ConferenceEvent, ConferenceRegistry},
    config::BridgeConfig,
    control::{AppState, ControlServer},
    network::UdpTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conference Bridge");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Arc::new(BridgeConfig::load(config_path.as_deref())?);
    config.validate()?;

    tracing::info!(
        "Tick {:?}, {} mixing thread(s), {} sender",
        config.tick(),
        config.sender.threads,
        if config.sender.single_sender { "single" } else { "per-conference" }
    );

    let registry = Arc::new(ConferenceRegistry::new(config.clone()));

    let udp = Arc::new(UdpTransport::bind(&config.network)?);
    udp.start(registry.clone())?;
    tracing::info!("RTP listening on {}", udp.local_addr());

    registry.start_senders();

    // Log conference events
    let events = registry.subscribe();
    std::thread::Builder::new()
        .name("event-log".to_string())
        .spawn(move || {
            for event in events.iter() {
                match &event {
                    ConferenceEvent::CallCancelled { .. } => tracing::warn!("{:?}", event),
                    _ => tracing::info!("{:?}", event),
                }
            }
        })?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let control = if config.control.enabled {
        let state = Arc::new(AppState::new(registry.clone(), Some(udp.clone())));
        let server = ControlServer::new(config.control.clone(), state);
        Some(tokio::spawn(server.run(shutdown_rx)))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let _ = shutdown_tx.send(());
    if let Some(control) = control {
        match control.await {
            Ok(Err(e)) => tracing::error!("Control API failed: {}", e),
            Err(e) => tracing::error!("Control API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    registry.shutdown();
    udp.stop();
    tracing::info!("Conference Bridge stopped");
    Ok(())
}
