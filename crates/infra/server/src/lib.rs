//! # Hookline Server
//!
//! Standalone process hosting the webhook dispatch engine and its retry
//! worker pool.

mod config;

pub use config::{ConfigError, ServerConfig, ServerSettings, load_config, parse_config};

use hookline_webhooks::{WebhookResult, WebhookSystem};
use std::sync::Arc;
use tokio::sync::watch;

/// The dispatch server.
pub struct HooklineServer {
    /// Server configuration.
    pub config: ServerConfig,
    system: Arc<WebhookSystem>,
}

impl HooklineServer {
    /// Creates a server over in-memory storage.
    pub fn new(config: ServerConfig) -> WebhookResult<Self> {
        let system = WebhookSystem::with_config(config.webhooks.clone())?;
        Ok(Self {
            config,
            system: Arc::new(system),
        })
    }

    /// The webhook system, for registering subscriptions and triggering
    /// events.
    pub fn system(&self) -> Arc<WebhookSystem> {
        self.system.clone()
    }

    /// Runs the retry workers until `shutdown` turns true, then waits for
    /// them to stop.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        tracing::info!(
            workers = self.config.webhooks.worker_count,
            event_source = %self.config.webhooks.event_source,
            "Starting Hookline server"
        );

        let workers = self.system.start_workers(shutdown);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Retry worker panicked");
            }
        }

        tracing::info!("Hookline server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut config = ServerConfig::default();
        config.webhooks = config.webhooks.worker_count(2).poll_interval_ms(10);
        let server = HooklineServer::new(config).unwrap();

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move { server.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
    }
}
