//! Server configuration.

use hookline_webhooks::WebhookConfig;
use serde::{Deserialize, Serialize};

/// Server-level settings from the `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Default tracing filter; `RUST_LOG` takes precedence.
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
    /// `[server]` section.
    pub server: ServerSettings,
    /// `[webhooks]` section.
    pub webhooks: WebhookConfig,
}

impl ServerConfig {
    /// Default tracing filter.
    pub fn log_level(&self) -> &str {
        &self.server.log_level
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &str) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    parse_config(&content)
}

/// Parses configuration from TOML text. Missing sections use defaults.
pub fn parse_config(content: &str) -> Result<ServerConfig, ConfigError> {
    let config: toml::Value =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let server: ServerSettings = section(&config, "server")?.unwrap_or_default();
    let webhooks: WebhookConfig = section(&config, "webhooks")?.unwrap_or_default();

    webhooks
        .validate()
        .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

    Ok(ServerConfig { server, webhooks })
}

fn section<T: for<'de> Deserialize<'de>>(
    config: &toml::Value,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    config
        .get(name)
        .map(|v| toml::Value::try_into(v.clone()))
        .transpose()
        .map_err(|e| ConfigError::ParseError(format!("[{name}]: {e}")))
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("IO error: {0}")]
    IoError(String),
    /// The file is not valid TOML or has wrongly typed values.
    #[error("Parse error: {0}")]
    ParseError(String),
    /// A value is out of range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookline_webhooks::BackoffConfig;

    #[test]
    fn test_default_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.webhooks, WebhookConfig::default());
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [server]
            log_level = "debug,hookline_webhooks=trace"

            [webhooks]
            event_source = "billing"
            worker_count = 2
            poll_interval_ms = 250
            max_retry_after_secs = 600

            [webhooks.backoff]
            strategy = "fixed"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level(), "debug,hookline_webhooks=trace");
        assert_eq!(config.webhooks.event_source, "billing");
        assert_eq!(config.webhooks.worker_count, 2);
        assert_eq!(config.webhooks.poll_interval_ms, 250);
        assert_eq!(config.webhooks.max_retry_after_secs, 600);
        assert_eq!(config.webhooks.backoff, BackoffConfig::Fixed);
        // Unset keys keep their defaults.
        assert_eq!(config.webhooks.batch_size, 50);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            parse_config("[webhooks]\nworker_count = \"many\""),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            parse_config("[webhooks]\nworker_count = 0"),
            Err(ConfigError::InvalidValue(_))
        ));
        assert!(matches!(
            load_config("/nonexistent/hookline.toml"),
            Err(ConfigError::IoError(_))
        ));
    }
}
