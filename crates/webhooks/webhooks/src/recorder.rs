//! Append-only delivery history and the views computed from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::delivery::{DeliveryAttempt, DeliveryStatus, TestInvocation};
use crate::error::{DeliveryError, WebhookResult};
use crate::storage::{AttemptQuery, JobQuery, WebhookStorage};

/// Aggregate delivery counters for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Attempts made.
    pub total: u64,
    /// Attempts the receiver accepted.
    pub success: u64,
    /// Attempts that failed, retried or not.
    pub failed: u64,
    /// `success / total`, 0 when nothing was sent.
    pub success_rate: f64,
    /// Time of the most recent attempt.
    pub last_delivery_at: Option<DateTime<Utc>>,
}

/// A delivery that will not reach its receiver without intervention.
///
/// Either its latest attempt is terminally failed, or it asked for a retry
/// that no open job is going to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDelivery {
    /// Correlation id of the delivery.
    pub correlation_id: String,
    /// Subscription ID.
    pub subscription_id: String,
    /// Event type.
    pub event_type: String,
    /// Attempts made.
    pub attempts: u32,
    /// True when it failed by running out of attempts rather than on a
    /// non-retryable error.
    pub exhausted: bool,
    /// True when the latest attempt is still `Retrying` but its retry was
    /// cancelled or never scheduled.
    pub abandoned: bool,
    /// The final attempt.
    pub last_attempt: DeliveryAttempt,
}

impl FailedDelivery {
    /// The terminal error, as an operator would see it.
    pub fn error(&self) -> Option<DeliveryError> {
        self.exhausted.then_some(DeliveryError::RetriesExhausted {
            attempts: self.attempts,
        })
    }
}

/// Writes attempt and test records and answers history queries.
#[derive(Clone)]
pub struct DeliveryRecorder {
    storage: Arc<dyn WebhookStorage>,
}

impl DeliveryRecorder {
    /// Creates a recorder over a storage backend.
    pub fn new(storage: Arc<dyn WebhookStorage>) -> Self {
        Self { storage }
    }

    /// Appends one attempt.
    pub async fn record_attempt(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        self.storage.append_attempt(attempt).await
    }

    /// Stores a test invocation, apart from production attempts.
    pub async fn record_test(&self, invocation: &TestInvocation) -> WebhookResult<()> {
        self.storage.save_test_invocation(invocation).await
    }

    /// Lists attempts, newest first.
    pub async fn attempts(&self, query: &AttemptQuery) -> WebhookResult<Vec<DeliveryAttempt>> {
        self.storage.list_attempts(query).await
    }

    /// All attempts of one delivery, oldest first.
    pub async fn attempts_for_correlation(
        &self,
        correlation_id: &str,
    ) -> WebhookResult<Vec<DeliveryAttempt>> {
        self.storage.attempts_for_correlation(correlation_id).await
    }

    /// Test invocations of a subscription, newest first.
    pub async fn test_invocations(&self, subscription_id: &str) -> WebhookResult<Vec<TestInvocation>> {
        self.storage.list_test_invocations(subscription_id).await
    }

    /// Counters for one subscription, computed from its attempts.
    pub async fn stats(&self, subscription_id: &str) -> WebhookResult<DeliveryStats> {
        let attempts = self
            .storage
            .list_attempts(&AttemptQuery::for_subscription(subscription_id))
            .await?;

        let total = attempts.len() as u64;
        let success = attempts
            .iter()
            .filter(|a| a.status == DeliveryStatus::Success)
            .count() as u64;
        let success_rate = if total == 0 {
            0.0
        } else {
            success as f64 / total as f64
        };

        Ok(DeliveryStats {
            total,
            success,
            failed: total - success,
            success_rate,
            last_delivery_at: attempts.iter().map(|a| a.created_at).max(),
        })
    }

    /// Whether a retry job for the delivery is pending or running.
    pub async fn has_open_retry(&self, correlation_id: &str) -> WebhookResult<bool> {
        let jobs = self
            .storage
            .list_jobs(&JobQuery {
                correlation_id: Some(correlation_id.to_string()),
                ..JobQuery::default()
            })
            .await?;
        Ok(jobs.iter().any(|job| job.status.is_open()))
    }

    /// Deliveries that are terminally failed or whose retry will never run,
    /// most recent first.
    ///
    /// Pass a subscription id to restrict the view.
    pub async fn failed_deliveries(
        &self,
        subscription_id: Option<&str>,
    ) -> WebhookResult<Vec<FailedDelivery>> {
        let query = AttemptQuery {
            subscription_id: subscription_id.map(str::to_string),
            ..AttemptQuery::default()
        };
        let attempts = self.storage.list_attempts(&query).await?;

        let mut latest: HashMap<&str, &DeliveryAttempt> = HashMap::new();
        for attempt in &attempts {
            latest
                .entry(attempt.correlation_id.as_str())
                .and_modify(|current| {
                    if attempt.attempt_number > current.attempt_number {
                        *current = attempt;
                    }
                })
                .or_insert(attempt);
        }

        let jobs = self
            .storage
            .list_jobs(&JobQuery {
                subscription_id: subscription_id.map(str::to_string),
                ..JobQuery::default()
            })
            .await?;
        let open: HashSet<&str> = jobs
            .iter()
            .filter(|job| job.status.is_open())
            .map(|job| job.correlation_id.as_str())
            .collect();

        let mut failed: Vec<_> = latest
            .into_values()
            .filter_map(|a| {
                let abandoned = a.status == DeliveryStatus::Retrying
                    && !open.contains(a.correlation_id.as_str());
                (a.status == DeliveryStatus::Failed || abandoned).then(|| FailedDelivery {
                    correlation_id: a.correlation_id.clone(),
                    subscription_id: a.subscription_id.clone(),
                    event_type: a.event_type.clone(),
                    attempts: a.attempt_number,
                    exhausted: a.status == DeliveryStatus::Failed && a.retryable,
                    abandoned,
                    last_attempt: a.clone(),
                })
            })
            .collect();
        failed.sort_by(|a, b| b.last_attempt.created_at.cmp(&a.last_attempt.created_at));
        Ok(failed)
    }
}
