//! One bounded HTTP delivery attempt and its classification.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT};
use serde_json::Value;
use tracing::{Instrument, info_span};

use crate::clock::Clock;
use crate::delivery::{AttemptOutcome, DeliveryAttempt, DeliveryResult, DeliveryStatus, RetryJob};
use crate::envelope::Envelope;
use crate::error::{DeliveryError, WebhookError, WebhookResult};
use crate::recorder::DeliveryRecorder;
use crate::security::{self, SigningMaterials};
use crate::subscription::WebhookSubscription;

/// Subscription public id.
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-ID";
/// Name of the emitting system.
pub const EVENT_SOURCE_HEADER: &str = "X-Event-Source";
/// Correlation id, stable across retries. Receivers deduplicate on it.
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-ID";
/// 1-based attempt number.
pub const DELIVERY_ATTEMPT_HEADER: &str = "X-Delivery-Attempt";

/// Longest response body kept on an attempt, in bytes.
const MAX_BODY_EXCERPT: usize = 1024;

/// What to deliver, and which attempt of the delivery this is.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Event type.
    pub event_type: String,
    /// Event payload.
    pub payload: Value,
    /// Event metadata for the envelope.
    pub metadata: Option<Value>,
    /// Correlation id shared by every attempt of the delivery.
    pub correlation_id: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

impl DispatchRequest {
    /// First attempt of a new delivery, with a fresh correlation id.
    pub fn initial(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: None,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            attempt_number: 1,
        }
    }

    /// Sets the envelope metadata.
    pub fn metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The attempt a retry job executes.
    pub fn from_job(job: &RetryJob) -> Self {
        Self {
            event_type: job.event_type.clone(),
            payload: job.payload.clone(),
            metadata: job.metadata.clone(),
            correlation_id: job.correlation_id.clone(),
            attempt_number: job.attempt_number,
        }
    }
}

/// Performs delivery attempts.
///
/// Redirects are never followed and certificates are always verified.
#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    recorder: DeliveryRecorder,
    clock: Arc<dyn Clock>,
    user_agent: String,
    event_source: String,
}

impl Dispatcher {
    /// Creates a dispatcher recording through `recorder`.
    pub fn new(recorder: DeliveryRecorder, clock: Arc<dyn Clock>) -> WebhookResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::HttpError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            recorder,
            clock,
            user_agent: format!("hookline/{}", env!("CARGO_PKG_VERSION")),
            event_source: "hookline".to_string(),
        })
    }

    /// Sets the `User-Agent` header value.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the `X-Event-Source` header value.
    pub fn event_source(mut self, source: impl Into<String>) -> Self {
        self.event_source = source.into();
        self
    }

    /// Delivers once and appends exactly one [`DeliveryAttempt`].
    ///
    /// The attempt is `Retrying` when the failure is retryable and the
    /// subscription's policy allows another attempt, `Failed` otherwise.
    pub async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        request: &DispatchRequest,
    ) -> WebhookResult<DeliveryResult> {
        let outcome = self.send(subscription, request).await;

        let status = if outcome.is_success() {
            DeliveryStatus::Success
        } else if outcome.is_retryable()
            && subscription.retry_policy.allows_retry_after(request.attempt_number)
        {
            DeliveryStatus::Retrying
        } else {
            DeliveryStatus::Failed
        };

        let attempt = DeliveryAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: request.correlation_id.clone(),
            subscription_id: subscription.id.clone(),
            tenant_id: subscription.tenant_id.clone(),
            event_type: request.event_type.clone(),
            payload: request.payload.clone(),
            metadata: request.metadata.clone(),
            attempt_number: request.attempt_number,
            status,
            retryable: outcome.is_retryable(),
            status_code: outcome.status_code,
            response_body: outcome.response_body.clone(),
            latency_ms: outcome.latency_ms,
            error: outcome.error.as_ref().map(ToString::to_string),
            created_at: self.clock.now(),
        };

        self.recorder.record_attempt(&attempt).await?;

        match status {
            DeliveryStatus::Success => tracing::info!(
                subscription_id = %attempt.subscription_id,
                correlation_id = %attempt.correlation_id,
                attempt = attempt.attempt_number,
                status = ?attempt.status_code,
                latency_ms = attempt.latency_ms,
                "Webhook delivered"
            ),
            DeliveryStatus::Retrying | DeliveryStatus::Failed => tracing::warn!(
                subscription_id = %attempt.subscription_id,
                correlation_id = %attempt.correlation_id,
                attempt = attempt.attempt_number,
                status = ?attempt.status_code,
                retryable = attempt.retryable,
                error = attempt.error.as_deref().unwrap_or_default(),
                "Webhook delivery failed"
            ),
        }

        Ok(DeliveryResult {
            attempt,
            error: outcome.error,
        })
    }

    /// Delivers once without recording anything.
    pub async fn send(
        &self,
        subscription: &WebhookSubscription,
        request: &DispatchRequest,
    ) -> AttemptOutcome {
        let span = info_span!(
            "webhook_delivery",
            subscription_id = %subscription.id,
            correlation_id = %request.correlation_id,
            event_type = %request.event_type,
            attempt = request.attempt_number
        );

        self.send_inner(subscription, request).instrument(span).await
    }

    async fn send_inner(
        &self,
        subscription: &WebhookSubscription,
        request: &DispatchRequest,
    ) -> AttemptOutcome {
        let now = self.clock.now();
        let (body, headers) = match self.prepare(subscription, request, now) {
            Ok(prepared) => prepared,
            Err(err) => {
                tracing::warn!(error = %err, "Delivery not sent");
                return AttemptOutcome {
                    status_code: None,
                    response_body: None,
                    latency_ms: 0,
                    error: Some(err),
                };
            }
        };

        let timeout = subscription.retry_policy.timeout();
        let started = Instant::now();

        let call = async {
            let response = self
                .client
                .request(subscription.method.as_reqwest(), &subscription.url)
                .headers(headers)
                .body(body)
                .timeout(timeout)
                .send()
                .await?;

            let status_code = response.status().as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, now));
            let body = match response.bytes().await {
                Ok(bytes) => excerpt(&bytes),
                Err(e) if e.is_timeout() => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to read response body: {}", e);
                    None
                }
            };

            Ok::<_, reqwest::Error>((status_code, retry_after, body))
        };

        // Dropping the future on expiry cancels the request.
        let result = tokio::time::timeout(timeout, call).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status_code, response_body, error) = match result {
            Err(_) => (None, None, Some(DeliveryError::timeout(timeout))),
            Ok(Err(e)) if e.is_timeout() => (None, None, Some(DeliveryError::timeout(timeout))),
            Ok(Err(e)) => (None, None, Some(DeliveryError::from(e))),
            Ok(Ok((status_code, retry_after, body))) => {
                tracing::debug!(status = status_code, latency_ms, "Received response");
                let error = DeliveryError::from_status(
                    status_code,
                    body.clone().unwrap_or_default(),
                    retry_after,
                );
                (Some(status_code), body, error)
            }
        };

        AttemptOutcome {
            status_code,
            response_body,
            latency_ms,
            error,
        }
    }

    /// Encodes the envelope and assembles headers. Nothing is sent if this
    /// fails.
    fn prepare(
        &self,
        subscription: &WebhookSubscription,
        request: &DispatchRequest,
        now: DateTime<Utc>,
    ) -> Result<(Vec<u8>, HeaderMap), DeliveryError> {
        let envelope = Envelope {
            subscription_public_id: subscription.public_id.clone(),
            event_type: request.event_type.clone(),
            timestamp: now,
            tenant_id: subscription.tenant_id.clone(),
            data: request.payload.clone(),
            metadata: request.metadata.clone(),
        };
        let body = envelope
            .encode(subscription.content_type)
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        let auth = security::sign(
            &subscription.security,
            SigningMaterials {
                timestamp: now.timestamp(),
                body: &body,
            },
        )?;

        let mut headers = HeaderMap::new();
        for (name, value) in &subscription.headers {
            if !is_managed_header(name) {
                insert_header(&mut headers, name, value)?;
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static(subscription.content_type.mime()));
        insert_header(&mut headers, USER_AGENT.as_str(), &self.user_agent)?;
        insert_header(&mut headers, WEBHOOK_ID_HEADER, &subscription.public_id)?;
        insert_header(&mut headers, EVENT_SOURCE_HEADER, &self.event_source)?;
        insert_header(&mut headers, DELIVERY_ID_HEADER, &request.correlation_id)?;
        insert_header(
            &mut headers,
            DELIVERY_ATTEMPT_HEADER,
            &request.attempt_number.to_string(),
        )?;

        // Signer output goes last so custom headers cannot shadow it.
        for (name, value) in &auth {
            insert_header(&mut headers, name, value)?;
        }

        Ok((body, headers))
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), DeliveryError> {
    let header_name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| DeliveryError::configuration(format!("invalid header name '{name}'")))?;
    let header_value = HeaderValue::from_str(value)
        .map_err(|_| DeliveryError::configuration(format!("invalid value for header '{name}'")))?;
    headers.insert(header_name, header_value);
    Ok(())
}

/// Headers owned by the dispatcher or the transport; custom values are
/// dropped.
fn is_managed_header(name: &str) -> bool {
    let lowercase = name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "x-webhook-id"
            | "x-event-source"
            | "x-delivery-id"
            | "x-delivery-attempt"
    )
}

/// Parses `Retry-After` as delta-seconds or an HTTP date.
///
/// Dates in the past yield zero; unparseable values are ignored.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc).signed_duration_since(now);
    Some(delta.num_seconds().max(0) as u64)
}

fn excerpt(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_BODY_EXCERPT {
        return Some(text.into_owned());
    }

    let suffix = "... (truncated)";
    let mut end = MAX_BODY_EXCERPT - suffix.len();
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Some(format!("{}{suffix}", &text[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::security::{SIGNATURE_HEADER, SecurityMethod, TIMESTAMP_HEADER, verify_hmac_signature};
    use crate::storage::{AttemptQuery, InMemoryWebhookStorage};
    use crate::subscription::{ContentType, HttpMethod, RetryPolicy};
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn dispatcher(clock: ManualClock) -> (Dispatcher, DeliveryRecorder) {
        let recorder = DeliveryRecorder::new(Arc::new(InMemoryWebhookStorage::new()));
        let dispatcher = Dispatcher::new(recorder.clone(), Arc::new(clock))
            .unwrap()
            .event_source("billing");
        (dispatcher, recorder)
    }

    fn subscription(url: String) -> WebhookSubscription {
        WebhookSubscription::new("tenant-1", url)
            .events(["order.created"])
            .retry_policy(RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(5)))
    }

    async fn respond_with(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_standard_headers_and_envelope() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::path("/hook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header("x-event-source", "billing"))
            .and(matchers::header("x-delivery-attempt", "1"))
            .and(matchers::header("x-team", "payments"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher(ManualClock::new());
        let sub = subscription(format!("{}/hook", server.uri()))
            .method(HttpMethod::Put)
            .header("X-Team", "payments")
            .header("X-Delivery-Attempt", "99");
        let request = DispatchRequest::initial("order.created", json!({"id": 42}))
            .metadata(Some(json!({"source": "checkout"})));

        let result = dispatcher.deliver(&sub, &request).await.unwrap();
        assert_eq!(result.attempt.status, DeliveryStatus::Success);
        assert_eq!(result.attempt.status_code, Some(204));

        let received = &server.received_requests().await.unwrap()[0];
        assert_eq!(received.headers["x-webhook-id"], sub.public_id.as_str());
        assert_eq!(received.headers["x-delivery-id"], request.correlation_id.as_str());
        assert!(received.headers["user-agent"].to_str().unwrap().starts_with("hookline/"));

        let body: Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(body["subscription_public_id"], sub.public_id.as_str());
        assert_eq!(body["tenant_id"], "tenant-1");
        assert_eq!(body["data"]["id"], 42);
        assert_eq!(body["metadata"]["source"], "checkout");
    }

    #[tokio::test]
    async fn test_hmac_headers_verify_on_receiver() {
        let server = respond_with(ResponseTemplate::new(200)).await;
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let (dispatcher, _) = dispatcher(ManualClock::starting_at(start));
        let sub = subscription(server.uri()).security(SecurityMethod::HmacSha256 {
            secret: "s3cr3t".to_string(),
        });

        dispatcher
            .deliver(&sub, &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        let received = &server.received_requests().await.unwrap()[0];
        let timestamp = received.headers[TIMESTAMP_HEADER].to_str().unwrap();
        let signature = received.headers[SIGNATURE_HEADER].to_str().unwrap();
        assert_eq!(timestamp, start.timestamp().to_string());
        assert!(
            verify_hmac_signature("s3cr3t", timestamp, signature, &received.body, 300, start.timestamp())
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_classification() {
        let cases = [
            (200, DeliveryStatus::Success, false),
            (302, DeliveryStatus::Success, false),
            (404, DeliveryStatus::Failed, false),
            (429, DeliveryStatus::Retrying, true),
            (500, DeliveryStatus::Retrying, true),
        ];

        for (code, status, retryable) in cases {
            let server = respond_with(ResponseTemplate::new(code)).await;
            let (dispatcher, _) = dispatcher(ManualClock::new());
            let sub = subscription(server.uri());

            let result = dispatcher
                .deliver(&sub, &DispatchRequest::initial("order.created", json!({})))
                .await
                .unwrap();

            assert_eq!(result.attempt.status, status, "HTTP {code}");
            assert_eq!(result.attempt.retryable, retryable, "HTTP {code}");
            assert_eq!(result.attempt.status_code, Some(code));
        }
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/elsewhere"))
            .mount(&server)
            .await;
        Mock::given(matchers::path("/elsewhere"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher(ManualClock::new());
        let sub = subscription(format!("{}/hook", server.uri()));
        let result = dispatcher
            .deliver(&sub, &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        assert_eq!(result.attempt.status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn test_client_error_keeps_body() {
        let server =
            respond_with(ResponseTemplate::new(422).set_body_string("missing field 'id'")).await;
        let (dispatcher, _) = dispatcher(ManualClock::new());

        let result = dispatcher
            .deliver(&subscription(server.uri()), &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        assert_eq!(result.attempt.status, DeliveryStatus::Failed);
        assert_eq!(result.attempt.response_body.as_deref(), Some("missing field 'id'"));
        assert_eq!(
            result.error,
            Some(DeliveryError::ClientError {
                status_code: 422,
                body: "missing field 'id'".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_rate_limit_retry_after() {
        let server =
            respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120")).await;
        let (dispatcher, _) = dispatcher(ManualClock::new());

        let result = dispatcher
            .deliver(&subscription(server.uri()), &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        assert!(result.needs_retry());
        assert_eq!(result.retry_after(), Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_last_attempt_is_failed_not_retrying() {
        let server = respond_with(ResponseTemplate::new(503)).await;
        let (dispatcher, _) = dispatcher(ManualClock::new());
        let mut request = DispatchRequest::initial("order.created", json!({}));
        request.attempt_number = 3;

        let result = dispatcher.deliver(&subscription(server.uri()), &request).await.unwrap();

        assert_eq!(result.attempt.status, DeliveryStatus::Failed);
        assert!(result.attempt.retryable);
        assert!(!result.needs_retry());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server =
            respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3))).await;
        let (dispatcher, _) = dispatcher(ManualClock::new());
        let sub = subscription(server.uri())
            .retry_policy(RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(1)));

        let result = dispatcher
            .deliver(&sub, &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        assert_eq!(result.error, Some(DeliveryError::Timeout { timeout_seconds: 1 }));
        assert_eq!(result.attempt.status, DeliveryStatus::Retrying);
        assert!(result.attempt.status_code.is_none());
    }

    #[tokio::test]
    async fn test_connection_failure_is_retryable() {
        let (dispatcher, _) = dispatcher(ManualClock::new());
        let sub = subscription("http://127.0.0.1:1/hook".to_string());

        let result = dispatcher
            .deliver(&sub, &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        assert!(matches!(result.error, Some(DeliveryError::Network { .. })));
        assert!(result.attempt.retryable);
    }

    #[tokio::test]
    async fn test_signing_failure_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (dispatcher, recorder) = dispatcher(ManualClock::new());
        let sub = subscription(server.uri()).security(SecurityMethod::BearerToken {
            token: String::new(),
        });

        let result = dispatcher
            .deliver(&sub, &DispatchRequest::initial("order.created", json!({})))
            .await
            .unwrap();

        assert!(matches!(result.error, Some(DeliveryError::Configuration { .. })));
        assert_eq!(result.attempt.status, DeliveryStatus::Failed);
        assert!(!result.attempt.retryable);

        // Still recorded.
        let attempts = recorder
            .attempts(&AttemptQuery::for_subscription(&sub.id))
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_form_content_type() {
        let server = MockServer::start().await;
        Mock::given(matchers::header("content-type", "application/x-www-form-urlencoded"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (dispatcher, _) = dispatcher(ManualClock::new());
        let sub = subscription(server.uri()).content_type(ContentType::FormUrlEncoded);
        let result = dispatcher
            .deliver(&sub, &DispatchRequest::initial("order.created", json!({"id": 1})))
            .await
            .unwrap();

        assert_eq!(result.attempt.status, DeliveryStatus::Success);
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_retry_after("30", now), Some(30));
        assert_eq!(parse_retry_after("Wed, 01 May 2024 12:01:00 GMT", now), Some(60));
        assert_eq!(parse_retry_after("Wed, 01 May 2024 11:00:00 GMT", now), Some(0));
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt(b""), None);
        assert_eq!(excerpt(b"ok").as_deref(), Some("ok"));

        let long = "é".repeat(MAX_BODY_EXCERPT);
        let cut = excerpt(long.as_bytes()).unwrap();
        assert!(cut.len() <= MAX_BODY_EXCERPT);
        assert!(cut.ends_with("... (truncated)"));
    }
}
