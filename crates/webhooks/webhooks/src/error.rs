//! Webhook error types.
//!
//! [`WebhookError`] covers administrative and storage operations.
//! [`DeliveryError`] is the classification of a single failed delivery
//! attempt; the scheduler only ever asks it whether it is retryable and
//! whether the receiver asked for a specific delay.

use std::time::Duration;

use thiserror::Error;

/// Result type for webhook operations.
pub type WebhookResult<T> = Result<T, WebhookError>;

/// Error type for webhook operations.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Subscription failed validation.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Security configuration is missing a required field.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Subscription not found.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// No delivery exists for the correlation id.
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    /// The delivery cannot be re-triggered in its current state.
    #[error("Delivery {0} is not terminally failed")]
    NotRetriggerable(String),

    /// Invalid payload.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// HTTP client could not be built.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Storage error.
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl From<serde_json::Error> for WebhookError {
    fn from(err: serde_json::Error) -> Self {
        WebhookError::InvalidPayload(err.to_string())
    }
}

/// Classified failure of one delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Bad or missing security config, or the body could not be encoded.
    /// Nothing was sent.
    #[error("configuration error: {message}")]
    Configuration {
        /// What was wrong.
        message: String,
    },

    /// Connection-level failure.
    #[error("network error: {message}")]
    Network {
        /// Error message describing the failure.
        message: String,
    },

    /// The request did not complete within the subscription timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured timeout.
        timeout_seconds: u64,
    },

    /// 4xx other than 429.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code.
        status_code: u16,
        /// Response body excerpt, kept for debugging.
        body: String,
    },

    /// 429 Too Many Requests.
    #[error("rate limited: HTTP 429")]
    RateLimited {
        /// Parsed `Retry-After`, if the receiver sent one.
        retry_after_seconds: Option<u64>,
    },

    /// 5xx.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code.
        status_code: u16,
        /// Response body excerpt.
        body: String,
    },

    /// All attempts for a delivery were used up.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_seconds: timeout.as_secs() }
    }

    /// Classifies a non-success HTTP status.
    ///
    /// Returns `None` for 200-399, which is a successful delivery.
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<u64>) -> Option<Self> {
        match status_code {
            200..=399 => None,
            429 => Some(Self::RateLimited { retry_after_seconds: retry_after }),
            400..=499 => Some(Self::ClientError { status_code, body: body.into() }),
            _ => Some(Self::ServerError { status_code, body: body.into() }),
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Non-429 client errors are terminal: the receiver rejected the request
    /// itself, and sending it again would be rejected the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. } => true,
            Self::Configuration { .. } | Self::ClientError { .. } | Self::RetriesExhausted { .. } => {
                false
            }
        }
    }

    /// Delay requested by the receiver via `Retry-After`.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_seconds: Some(secs) } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Response body preserved for the failure, if any.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ClientError { body, .. } | Self::ServerError { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        // Without the configured limit at hand a timeout reads as a network
        // failure; the dispatcher reports real timeouts itself.
        if err.is_timeout() {
            DeliveryError::network(format!("request timed out: {err}"))
        } else if err.is_connect() {
            DeliveryError::network(format!("connection failed: {err}"))
        } else {
            DeliveryError::network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(DeliveryError::from_status(200, "", None), None);
        assert_eq!(DeliveryError::from_status(302, "", None), None);
        assert_eq!(DeliveryError::from_status(399, "", None), None);

        let rate_limited = DeliveryError::from_status(429, "", Some(30)).unwrap();
        assert!(rate_limited.is_retryable());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(30)));

        let not_found = DeliveryError::from_status(404, "no such hook", None).unwrap();
        assert!(!not_found.is_retryable());
        assert_eq!(not_found.response_body(), Some("no such hook"));

        let unavailable = DeliveryError::from_status(503, "", None).unwrap();
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.retry_after(), None);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(5)).is_retryable());

        assert!(!DeliveryError::configuration("missing secret").is_retryable());
        assert!(!DeliveryError::RetriesExhausted { attempts: 3 }.is_retryable());
    }

    #[tokio::test]
    async fn test_client_timeout_maps_to_network() {
        use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let err = client.get(server.uri()).send().await.unwrap_err();
        assert!(err.is_timeout());

        let classified = DeliveryError::from(err);
        assert!(matches!(classified, DeliveryError::Network { .. }));
        assert!(classified.is_retryable());
        assert!(classified.to_string().starts_with("network error: request timed out"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            DeliveryError::timeout(Duration::from_secs(5)).to_string(),
            "request timeout after 5s"
        );
        assert_eq!(
            DeliveryError::from_status(500, "", None).unwrap().to_string(),
            "server error: HTTP 500"
        );
    }
}
