//! Balancer - standalone edge listeners
//!
//! Usage:
//!   balancer [config.toml]
//!
//! Reads the `[[balancer.listeners]]` and `[proxy]` tables and runs each
//! listener (redirect or fixed-target proxy) until SIGINT/SIGTERM.

use std::path::PathBuf;
use tracing::{error, info};
use vipgate::api::{PKG_NAME, VERSION};
use vipgate::balancer::Balancer;
use vipgate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vipgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("balancer.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(name = PKG_NAME, version = VERSION, "Starting balancer");

    if config.balancer.listeners.is_empty() {
        anyhow::bail!("No balancer listeners configured in {}", config_path.display());
    }

    for listener in &config.balancer.listeners {
        info!(
            bind = %listener.bind,
            scheme = %listener.scheme,
            mode = ?listener.mode,
            to = %listener.target,
            "Balancer listener"
        );
    }

    let balancer = Balancer::start(&config.balancer, &config.proxy).await?;
    info!(addrs = ?balancer.local_addrs(), "Balancer running");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    balancer.stop().await;
    info!("Shutdown complete");
    Ok(())
}
