//! # Hookline Webhooks
//!
//! Delivers internal domain events to externally registered HTTP endpoints:
//! - Per-tenant subscriptions with exact event-type matching
//! - Concurrent, isolated fan-out with a bounded timeout per request
//! - Pluggable request authentication (Basic, Bearer, API key, HMAC-SHA256,
//!   shared secret)
//! - Failure classification and scheduled retries with leased claims
//! - Append-only delivery history and test deliveries
//!
//! ## Example
//!
//! ```rust,ignore
//! use hookline_webhooks::{WebhookSystem, WebhookSubscription, SecurityMethod};
//!
//! let system = WebhookSystem::new()?;
//!
//! let sub = WebhookSubscription::new("tenant-1", "https://example.com/hook")
//!     .events(["order.created"])
//!     .security(SecurityMethod::HmacSha256 { secret: "s3cr3t".into() });
//! system.register_subscription(sub).await?;
//!
//! system.trigger_event("order.created", json!({"id": 42}), "tenant-1").await?;
//! ```

mod clock;
mod delivery;
mod dispatcher;
mod envelope;
mod error;
mod harness;
mod recorder;
mod retry;
mod router;
mod scheduler;
mod security;
mod storage;
mod subscription;
mod system;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{
    AttemptOutcome, DeliveryAttempt, DeliveryResult, DeliveryStatus, RetryJob, RetryJobStatus,
    TestInvocation,
};
pub use dispatcher::{
    DELIVERY_ATTEMPT_HEADER, DELIVERY_ID_HEADER, DispatchRequest, Dispatcher, EVENT_SOURCE_HEADER,
    WEBHOOK_ID_HEADER, parse_retry_after,
};
pub use envelope::Envelope;
pub use error::{DeliveryError, WebhookError, WebhookResult};
pub use harness::TestHarness;
pub use recorder::{DeliveryRecorder, DeliveryStats, FailedDelivery};
pub use retry::{
    BackoffConfig, ExponentialBackoff, FixedDelay, MAX_RETRY_DELAY_SECS, RetryStrategy, retry_delay,
};
pub use router::{EventRouter, FanOut};
pub use scheduler::RetryScheduler;
pub use security::{
    DEFAULT_SECRET_HEADER, HmacSigner, SIGNATURE_HEADER, SecurityMethod, SigningError,
    SigningMaterials, TIMESTAMP_HEADER, VerificationError, sign, verify_hmac_signature,
};
pub use storage::{AttemptQuery, InMemoryWebhookStorage, JobQuery, WebhookStorage};
pub use subscription::{ContentType, HttpMethod, RetryPolicy, WebhookSubscription};
pub use system::{WebhookConfig, WebhookSystem};
