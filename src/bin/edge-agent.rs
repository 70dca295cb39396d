//! Edge node agent
//!
//! Usage: edge-agent [agent.toml]

use edgeplane::agent::EdgeAgent;
use edgeplane::config::AgentConfig;
use edgeplane::db::Database;
use edgeplane::deploy::Deployer;
use edgeplane::ledger::Ledger;
use edgeplane::VERSION;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgeplane=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("agent.toml"));

    let config = AgentConfig::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load agent configuration");
        e
    })?;

    info!(path = %config_path.display(), version = VERSION, "Agent configuration loaded");

    let db = Arc::new(Database::open(&config.database_path)?);
    let deployer = Arc::new(Deployer::from_config(&config.deploy, Ledger::new(db))?);
    let agent = Arc::new(EdgeAgent::new(config, deployer)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&agent).run(shutdown_rx));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    info!("Shutdown complete");
    Ok(())
}
