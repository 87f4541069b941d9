use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hubgate::bus::LocalBus;
use hubgate::config::Settings;
use hubgate::gateway::Gateway;
use hubgate::handler::ChainBuilders;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hubgate=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gateway.toml"));

    let settings = Settings::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        base_host = %settings.base_host,
        port = settings.port,
        channel = %settings.channel_name,
        preloaded = settings.services.len(),
        "starting gateway"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bus = Arc::new(LocalBus::new());
    let gateway = Gateway::new(settings, ChainBuilders::builtin(), bus, shutdown_rx);

    let mut gateway_task = tokio::spawn(gateway.run());

    tokio::select! {
        result = &mut gateway_task => {
            // fatal: bind failure or subscription termination
            return match result {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow::anyhow!("gateway task failed: {}", e)),
            };
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
        }
    }

    // let in-flight requests finish best-effort
    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_task).await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C, shutting down");
}
