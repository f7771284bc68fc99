//! Hookline Server binary.
//!
//! Usage: `hookline-server [config.toml]`

use hookline_server::{HooklineServer, ServerConfig, load_config};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(&path)?,
        None => ServerConfig::default(),
    };

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level()))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = HooklineServer::new(config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await;

    Ok(())
}
