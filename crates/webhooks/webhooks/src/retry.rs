//! Retry backoff strategies.
//!
//! The base delay comes from each subscription's [`RetryPolicy`]; a strategy
//! only decides how it grows with the attempt number.
//!
//! [`RetryPolicy`]: crate::subscription::RetryPolicy

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on any configured retry delay: 30 days.
pub const MAX_RETRY_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

/// Trait for retry strategies.
pub trait RetryStrategy: Send + Sync + std::fmt::Debug {
    /// Delay before the attempt following `attempt_number` (1-based).
    fn next_delay(&self, base: Duration, attempt_number: u32) -> Duration;
}

/// Exponential backoff retry strategy.
///
/// Delay doubles per attempt: `base * 2^(attempt_number - 1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    /// Creates a new exponential backoff strategy.
    pub fn new() -> Self {
        Self {
            max_delay: Duration::from_secs(3600), // 1 hour
        }
    }

    /// Sets the maximum delay.
    pub fn max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, base: Duration, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(31);
        let delay = base.saturating_mul(1_u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Fixed delay retry strategy.
///
/// Always waits the base delay.
#[derive(Debug, Clone, Default)]
pub struct FixedDelay;

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, base: Duration, _attempt_number: u32) -> Duration {
        base
    }
}

/// Serializable choice of strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// [`FixedDelay`].
    Fixed,
    /// [`ExponentialBackoff`].
    Exponential {
        /// Cap on a single delay, in seconds.
        max_delay_secs: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential { max_delay_secs: 3600 }
    }
}

impl BackoffConfig {
    /// Builds the configured strategy.
    pub fn build(self) -> Arc<dyn RetryStrategy> {
        match self {
            BackoffConfig::Fixed => Arc::new(FixedDelay),
            BackoffConfig::Exponential { max_delay_secs } => {
                Arc::new(ExponentialBackoff::new().max_delay(Duration::from_secs(max_delay_secs)))
            }
        }
    }
}

/// Picks the delay before the next attempt.
///
/// A receiver's `Retry-After` wins over the strategy, clamped to
/// `max_retry_after`.
pub fn retry_delay(
    strategy: &dyn RetryStrategy,
    base: Duration,
    attempt_number: u32,
    retry_after: Option<Duration>,
    max_retry_after: Duration,
) -> Duration {
    match retry_after {
        Some(hint) => hint.min(max_retry_after),
        None => strategy.next_delay(base, attempt_number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let strategy = ExponentialBackoff::new().max_delay(Duration::from_secs(300));
        let base = Duration::from_secs(60);

        assert_eq!(strategy.next_delay(base, 1), Duration::from_secs(60));
        assert_eq!(strategy.next_delay(base, 2), Duration::from_secs(120));
        assert_eq!(strategy.next_delay(base, 3), Duration::from_secs(240));
        assert_eq!(strategy.next_delay(base, 4), Duration::from_secs(300));
        assert_eq!(strategy.next_delay(base, 100), Duration::from_secs(300));
    }

    #[test]
    fn test_fixed_delay() {
        let base = Duration::from_secs(10);
        assert_eq!(FixedDelay.next_delay(base, 1), base);
        assert_eq!(FixedDelay.next_delay(base, 5), base);
    }

    #[test]
    fn test_retry_after_takes_precedence() {
        let strategy = FixedDelay;
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(600);

        assert_eq!(retry_delay(&strategy, base, 1, None, max), base);
        assert_eq!(
            retry_delay(&strategy, base, 1, Some(Duration::from_secs(5)), max),
            Duration::from_secs(5)
        );
        assert_eq!(
            retry_delay(&strategy, base, 1, Some(Duration::from_secs(86_400)), max),
            max
        );
    }

    #[test]
    fn test_backoff_config_serde() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"strategy":"exponential","max_delay_secs":120}"#).unwrap();
        assert_eq!(config, BackoffConfig::Exponential { max_delay_secs: 120 });

        let strategy = config.build();
        assert_eq!(
            strategy.next_delay(Duration::from_secs(60), 3),
            Duration::from_secs(120)
        );

        let fixed: BackoffConfig = serde_json::from_str(r#"{"strategy":"fixed"}"#).unwrap();
        assert_eq!(fixed, BackoffConfig::Fixed);
    }
}
