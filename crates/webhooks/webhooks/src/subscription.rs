//! Webhook subscription configuration.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::error::{WebhookError, WebhookResult};
use crate::retry::MAX_RETRY_DELAY_SECS;
use crate::security::SecurityMethod;

/// Upper bound on a single request timeout.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// A registered external endpoint interested in one or more event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Internal identifier.
    pub id: String,
    /// Identifier exposed to receivers in the envelope. Exact lookup key.
    pub public_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Target URL.
    pub url: String,
    /// HTTP method used for delivery.
    pub method: HttpMethod,
    /// Body encoding.
    pub content_type: ContentType,
    /// Subscribed event types. Must not be empty.
    pub events: BTreeSet<String>,
    /// Custom headers added to every request.
    pub headers: HashMap<String, String>,
    /// Request authentication.
    pub security: SecurityMethod,
    /// Inactive subscriptions receive nothing. Subscriptions are never deleted.
    pub active: bool,
    /// Retry and timeout policy.
    pub retry_policy: RetryPolicy,
    /// Human-readable description.
    pub description: Option<String>,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// When the subscription was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Creates a new active subscription with defaults (POST, JSON, no auth).
    pub fn new(tenant_id: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            public_id: format!("whs_{}", uuid::Uuid::new_v4().simple()),
            tenant_id: tenant_id.into(),
            url: url.into(),
            method: HttpMethod::Post,
            content_type: ContentType::Json,
            events: BTreeSet::new(),
            headers: HashMap::new(),
            security: SecurityMethod::None,
            active: true,
            retry_policy: RetryPolicy::default(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Subscribes to specific events.
    pub fn events(mut self, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.events = events.into_iter().map(|e| e.into()).collect();
        self
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Sets the body encoding.
    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Sets the authentication method.
    pub fn security(mut self, security: SecurityMethod) -> Self {
        self.security = security;
        self
    }

    /// Sets authentication from a stored method name and opaque config.
    pub fn security_config(mut self, method: &str, config: &Value) -> WebhookResult<Self> {
        self.security = SecurityMethod::from_config(method, config)?;
        Ok(self)
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Adds a custom header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Creates the subscription deactivated.
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Checks if this subscription should receive an event.
    pub fn should_receive(&self, tenant_id: &str, event_type: &str) -> bool {
        self.active && self.tenant_id == tenant_id && self.events.contains(event_type)
    }

    /// Validates the subscription before it is stored.
    pub fn validate(&self) -> WebhookResult<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(invalid("tenant id is required"));
        }

        let url = url::Url::parse(&self.url).map_err(|e| invalid(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported url scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("url has no host"));
        }

        if self.events.is_empty() {
            return Err(invalid("at least one event type is required"));
        }
        if self.events.iter().any(|e| e.trim().is_empty()) {
            return Err(invalid("event types must not be blank"));
        }

        for (name, value) in &self.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid(format!("invalid header name '{name}'")))?;
            HeaderValue::from_str(value)
                .map_err(|_| invalid(format!("invalid value for header '{name}'")))?;
        }

        self.retry_policy.validate()?;
        self.security.validate()
    }
}

fn invalid(message: impl Into<String>) -> WebhookError {
    WebhookError::InvalidSubscription(message.into())
}

/// HTTP method used for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    #[default]
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Converts to the HTTP client's method type.
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Body encoding of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ContentType {
    /// `application/json`
    #[default]
    #[serde(rename = "application/json")]
    Json,
    /// `application/xml`
    #[serde(rename = "application/xml")]
    Xml,
    /// `application/x-www-form-urlencoded`
    #[serde(rename = "application/x-www-form-urlencoded")]
    FormUrlEncoded,
    /// `text/plain`
    #[serde(rename = "text/plain")]
    PlainText,
}

impl ContentType {
    /// MIME type sent in the `Content-Type` header.
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Xml => "application/xml",
            ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
            ContentType::PlainText => "text/plain",
        }
    }
}

/// Per-subscription retry and timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per delivery, the initial attempt included.
    pub max_attempts: u32,
    /// Base delay between attempts, in seconds.
    pub base_delay_secs: u64,
    /// Hard bound on a single HTTP request, in seconds.
    pub timeout_secs: u64,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_attempts: u32, base_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_secs: base_delay.as_secs(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Base delay between attempts.
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether another attempt is allowed after `attempt_number`.
    pub fn allows_retry_after(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }

    fn validate(&self) -> WebhookResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("timeout must be greater than zero"));
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(invalid(format!("timeout must be at most {MAX_TIMEOUT_SECS}s")));
        }
        if self.base_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(invalid(format!(
                "base delay must be at most {MAX_RETRY_DELAY_SECS}s"
            )));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription() -> WebhookSubscription {
        WebhookSubscription::new("tenant-1", "https://example.test/hook")
            .events(["order.created", "invoice.paid"])
    }

    #[test]
    fn test_should_receive() {
        let sub = subscription();

        assert!(sub.should_receive("tenant-1", "order.created"));
        assert!(sub.should_receive("tenant-1", "invoice.paid"));
        assert!(!sub.should_receive("tenant-1", "order.updated"));
        assert!(!sub.should_receive("tenant-2", "order.created"));

        let inactive = sub.inactive();
        assert!(!inactive.should_receive("tenant-1", "order.created"));
    }

    #[test]
    fn test_validate_accepts_complete_subscription() {
        let sub = subscription()
            .security_config("hmac_sha256", &json!({"secret": "s3cr3t"}))
            .unwrap()
            .header("X-Team", "payments");
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let no_events = WebhookSubscription::new("tenant-1", "https://example.test/hook");
        assert!(matches!(no_events.validate(), Err(WebhookError::InvalidSubscription(_))));

        let bad_scheme = WebhookSubscription::new("tenant-1", "ftp://example.test").events(["a.b"]);
        assert!(bad_scheme.validate().is_err());

        let bad_url = WebhookSubscription::new("tenant-1", "not a url").events(["a.b"]);
        assert!(bad_url.validate().is_err());

        let zero_attempts = subscription().retry_policy(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        assert!(zero_attempts.validate().is_err());

        let bad_header = subscription().header("Bad Header", "x");
        assert!(bad_header.validate().is_err());

        let endless_delay = subscription().retry_policy(RetryPolicy {
            base_delay_secs: 10_000_000_000_000,
            ..RetryPolicy::default()
        });
        assert!(endless_delay.validate().is_err());

        let endless_timeout = subscription().retry_policy(RetryPolicy {
            timeout_secs: u64::MAX,
            ..RetryPolicy::default()
        });
        assert!(endless_timeout.validate().is_err());

        let longest = subscription().retry_policy(RetryPolicy {
            base_delay_secs: MAX_RETRY_DELAY_SECS,
            ..RetryPolicy::default()
        });
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_incomplete_security() {
        let sub = subscription().security(SecurityMethod::BearerToken { token: String::new() });
        assert!(matches!(sub.validate(), Err(WebhookError::ConfigError(_))));

        assert!(
            subscription()
                .security_config("basic", &json!({"username": "u"}))
                .is_err()
        );
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(policy.base_delay(), Duration::from_secs(60));
        assert_eq!(policy.timeout(), Duration::from_secs(5));
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
    }

    #[test]
    fn test_content_type_serde() {
        let json = serde_json::to_string(&ContentType::FormUrlEncoded).unwrap();
        assert_eq!(json, "\"application/x-www-form-urlencoded\"");
        assert_eq!(ContentType::Xml.mime(), "application/xml");
    }
}
