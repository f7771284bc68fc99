//! Delivery records: attempts, retry jobs and test invocations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::DeliveryError;
use crate::subscription::WebhookSubscription;

/// Status of a recorded attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Receiver answered 200-399.
    Success,
    /// Failed and no further attempt will be made.
    Failed,
    /// Failed and a retry is scheduled.
    Retrying,
}

/// One delivery attempt. Append-only: never modified once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Attempt ID.
    pub id: String,
    /// Links all attempts of one event occurrence for one subscription.
    pub correlation_id: String,
    /// Subscription ID.
    pub subscription_id: String,
    /// Tenant ID.
    pub tenant_id: String,
    /// Event type.
    pub event_type: String,
    /// Payload snapshot as delivered.
    pub payload: Value,
    /// Event metadata carried in the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// 1 for the initial attempt, monotonic per correlation id.
    pub attempt_number: u32,
    /// Outcome status.
    pub status: DeliveryStatus,
    /// Whether the failure was classified retryable.
    pub retryable: bool,
    /// HTTP status code (if a response was received).
    pub status_code: Option<u16>,
    /// Response body excerpt.
    pub response_body: Option<String>,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Error message (if failed).
    pub error: Option<String>,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Whether no further attempt follows this one.
    pub fn is_terminal(&self) -> bool {
        self.status != DeliveryStatus::Retrying
    }
}

/// Raw result of one HTTP exchange, before it is recorded anywhere.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// HTTP status code, if a response arrived.
    pub status_code: Option<u16>,
    /// Response body excerpt.
    pub response_body: Option<String>,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Classified failure; `None` on success.
    pub error: Option<DeliveryError>,
}

impl AttemptOutcome {
    /// Whether the receiver accepted the delivery.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(DeliveryError::is_retryable)
    }

    /// Delay the receiver asked for.
    pub fn retry_after(&self) -> Option<Duration> {
        self.error.as_ref().and_then(DeliveryError::retry_after)
    }
}

/// What the dispatcher hands back after recording an attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// The attempt as recorded.
    pub attempt: DeliveryAttempt,
    /// Classified failure; `None` on success.
    pub error: Option<DeliveryError>,
}

impl DeliveryResult {
    /// Whether the scheduler should create a retry job.
    pub fn needs_retry(&self) -> bool {
        self.attempt.status == DeliveryStatus::Retrying
    }

    /// Delay the receiver asked for.
    pub fn retry_after(&self) -> Option<Duration> {
        self.error.as_ref().and_then(DeliveryError::retry_after)
    }
}

/// Retry job status. Moves one way only: `Pending → InProgress → Done`,
/// or to `Cancelled` from either open state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetryJobStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Executed.
    Done,
    /// Cancelled before the delivery went out.
    Cancelled,
}

impl RetryJobStatus {
    /// Whether the job is still live.
    pub fn is_open(self) -> bool {
        matches!(self, RetryJobStatus::Pending | RetryJobStatus::InProgress)
    }
}

/// A scheduled retry of a delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryJob {
    /// Job ID.
    pub id: String,
    /// Correlation id of the delivery being retried.
    pub correlation_id: String,
    /// Subscription ID.
    pub subscription_id: String,
    /// Tenant ID.
    pub tenant_id: String,
    /// Event type.
    pub event_type: String,
    /// Payload snapshot.
    pub payload: Value,
    /// Event metadata snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Attempt number this job will execute.
    pub attempt_number: u32,
    /// Earliest time the job may run.
    pub scheduled_at: DateTime<Utc>,
    /// Status.
    pub status: RetryJobStatus,
    /// Worker holding the claim.
    pub claimed_by: Option<String>,
    /// Claim expiry; after this another worker may take over.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Created at.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl RetryJob {
    /// Schedules `attempt_number` of a delivery at `scheduled_at`.
    pub fn new(
        previous: &DeliveryAttempt,
        attempt_number: u32,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            correlation_id: previous.correlation_id.clone(),
            subscription_id: previous.subscription_id.clone(),
            tenant_id: previous.tenant_id.clone(),
            event_type: previous.event_type.clone(),
            payload: previous.payload.clone(),
            metadata: previous.metadata.clone(),
            attempt_number,
            scheduled_at,
            status: RetryJobStatus::Pending,
            claimed_by: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a worker may claim the job at `now`.
    ///
    /// Pending jobs are claimable once due; in-progress jobs only once their
    /// lease has lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            RetryJobStatus::Pending => self.scheduled_at <= now,
            RetryJobStatus::InProgress => self.lease_expires_at.is_some_and(|lease| lease <= now),
            RetryJobStatus::Done | RetryJobStatus::Cancelled => false,
        }
    }
}

/// A manual test delivery. Kept apart from production attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestInvocation {
    /// Invocation ID.
    pub id: String,
    /// Subscription ID.
    pub subscription_id: String,
    /// Tenant ID.
    pub tenant_id: String,
    /// Event type.
    pub event_type: String,
    /// Sample payload.
    pub payload: Value,
    /// `Success` or `Failed`; never `Retrying`.
    pub status: DeliveryStatus,
    /// HTTP status code (if a response was received).
    pub status_code: Option<u16>,
    /// Response body excerpt.
    pub response_body: Option<String>,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Error message (if failed).
    pub error: Option<String>,
    /// When the test ran.
    pub created_at: DateTime<Utc>,
}

impl TestInvocation {
    /// Records the outcome of a test delivery.
    pub fn from_outcome(
        subscription: &WebhookSubscription,
        event_type: &str,
        payload: Value,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subscription_id: subscription.id.clone(),
            tenant_id: subscription.tenant_id.clone(),
            event_type: event_type.to_string(),
            payload,
            status: if outcome.is_success() {
                DeliveryStatus::Success
            } else {
                DeliveryStatus::Failed
            },
            status_code: outcome.status_code,
            response_body: outcome.response_body.clone(),
            latency_ms: outcome.latency_ms,
            error: outcome.error.as_ref().map(ToString::to_string),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn attempt() -> DeliveryAttempt {
        DeliveryAttempt {
            id: "a1".to_string(),
            correlation_id: "c1".to_string(),
            subscription_id: "s1".to_string(),
            tenant_id: "t1".to_string(),
            event_type: "order.created".to_string(),
            payload: serde_json::json!({"id": 42}),
            metadata: None,
            attempt_number: 1,
            status: DeliveryStatus::Retrying,
            retryable: true,
            status_code: Some(500),
            response_body: None,
            latency_ms: 12,
            error: Some("server error: HTTP 500".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_retry_job_copies_snapshot() {
        let now = Utc::now();
        let job = RetryJob::new(&attempt(), 2, now + ChronoDuration::seconds(60), now);

        assert_eq!(job.correlation_id, "c1");
        assert_eq!(job.attempt_number, 2);
        assert_eq!(job.payload["id"], 42);
        assert_eq!(job.status, RetryJobStatus::Pending);
    }

    #[test]
    fn test_job_claimability() {
        let now = Utc::now();
        let mut job = RetryJob::new(&attempt(), 2, now + ChronoDuration::seconds(60), now);

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + ChronoDuration::seconds(60)));

        job.status = RetryJobStatus::InProgress;
        job.lease_expires_at = Some(now + ChronoDuration::seconds(90));
        assert!(!job.is_claimable(now + ChronoDuration::seconds(61)));
        assert!(job.is_claimable(now + ChronoDuration::seconds(90)));

        job.status = RetryJobStatus::Cancelled;
        assert!(!job.is_claimable(now + ChronoDuration::days(1)));
    }

    #[test]
    fn test_terminal_attempts() {
        let mut a = attempt();
        assert!(!a.is_terminal());
        a.status = DeliveryStatus::Failed;
        assert!(a.is_terminal());
    }
}
