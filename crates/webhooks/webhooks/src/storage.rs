//! Webhook storage trait for persistence.
//!
//! Attempts are append-only. Retry jobs change status only through the
//! conditional operations [`WebhookStorage::claim_job`],
//! [`WebhookStorage::finish_job`] and [`WebhookStorage::cancel_pending_jobs`];
//! a backend must apply each of them atomically (a single guarded `UPDATE …
//! WHERE status = …` in SQL, a write lock here).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::delivery::{DeliveryAttempt, DeliveryStatus, RetryJob, RetryJobStatus, TestInvocation};
use crate::error::{WebhookError, WebhookResult};
use crate::subscription::WebhookSubscription;

/// Filter for listing delivery attempts.
#[derive(Debug, Clone, Default)]
pub struct AttemptQuery {
    /// Only attempts for this subscription.
    pub subscription_id: Option<String>,
    /// Only attempts with this status.
    pub status: Option<DeliveryStatus>,
    /// Only attempts created at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only attempts created before this time.
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of results, newest first.
    pub limit: Option<usize>,
}

impl AttemptQuery {
    /// Attempts for one subscription.
    pub fn for_subscription(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: Some(subscription_id.into()),
            ..Self::default()
        }
    }

    /// Restricts to a status.
    pub fn status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to `[from, to)`.
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Checks if an attempt passes the filter.
    pub fn matches(&self, attempt: &DeliveryAttempt) -> bool {
        self.subscription_id
            .as_ref()
            .is_none_or(|id| &attempt.subscription_id == id)
            && self.status.is_none_or(|s| attempt.status == s)
            && self.from.is_none_or(|from| attempt.created_at >= from)
            && self.to.is_none_or(|to| attempt.created_at < to)
    }
}

/// Filter for listing retry jobs.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only jobs for this subscription.
    pub subscription_id: Option<String>,
    /// Only jobs for this delivery.
    pub correlation_id: Option<String>,
    /// Only jobs with this status.
    pub status: Option<RetryJobStatus>,
}

impl JobQuery {
    /// Checks if a job passes the filter.
    pub fn matches(&self, job: &RetryJob) -> bool {
        self.subscription_id
            .as_ref()
            .is_none_or(|id| &job.subscription_id == id)
            && self
                .correlation_id
                .as_ref()
                .is_none_or(|id| &job.correlation_id == id)
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// Trait for webhook storage backends.
#[async_trait]
pub trait WebhookStorage: Send + Sync {
    // ==================== Subscription Operations ====================

    /// Inserts or replaces a subscription.
    async fn save_subscription(&self, subscription: &WebhookSubscription) -> WebhookResult<()>;

    /// Gets a subscription by ID.
    async fn get_subscription(&self, id: &str) -> WebhookResult<Option<WebhookSubscription>>;

    /// Gets a subscription by its public id (exact match).
    async fn find_by_public_id(&self, public_id: &str)
    -> WebhookResult<Option<WebhookSubscription>>;

    /// Lists a tenant's subscriptions, active or not.
    async fn list_subscriptions(&self, tenant_id: &str) -> WebhookResult<Vec<WebhookSubscription>>;

    /// Active subscriptions of `tenant_id` subscribed to `event_type`.
    async fn matching_subscriptions(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> WebhookResult<Vec<WebhookSubscription>>;

    // ==================== Attempt Operations ====================

    /// Appends a delivery attempt. Existing attempts are never touched.
    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> WebhookResult<()>;

    /// Lists attempts matching a query, newest first.
    async fn list_attempts(&self, query: &AttemptQuery) -> WebhookResult<Vec<DeliveryAttempt>>;

    /// All attempts of one delivery, oldest first.
    async fn attempts_for_correlation(
        &self,
        correlation_id: &str,
    ) -> WebhookResult<Vec<DeliveryAttempt>>;

    // ==================== Retry Job Operations ====================

    /// Inserts a new pending job.
    async fn insert_job(&self, job: &RetryJob) -> WebhookResult<()>;

    /// Gets a job by ID.
    async fn get_job(&self, id: &str) -> WebhookResult<Option<RetryJob>>;

    /// Jobs claimable at `now`, earliest first.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> WebhookResult<Vec<RetryJob>>;

    /// Atomically claims a job for `worker_id`.
    ///
    /// Succeeds only if the job is claimable at `now` (see
    /// [`RetryJob::is_claimable`]). Returns the claimed job, or `None` if
    /// another worker got there first.
    async fn claim_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> WebhookResult<Option<RetryJob>>;

    /// Moves an in-progress job owned by `worker_id` to `Done` or `Cancelled`.
    ///
    /// Returns `false` if the job is no longer owned by the worker.
    async fn finish_job(
        &self,
        id: &str,
        worker_id: &str,
        status: RetryJobStatus,
        now: DateTime<Utc>,
    ) -> WebhookResult<bool>;

    /// Cancels every pending job of a subscription. Claimed jobs are left
    /// alone. Returns the number cancelled.
    async fn cancel_pending_jobs(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<usize>;

    /// Lists jobs matching a query.
    async fn list_jobs(&self, query: &JobQuery) -> WebhookResult<Vec<RetryJob>>;

    // ==================== Test Invocation Operations ====================

    /// Saves a test invocation.
    async fn save_test_invocation(&self, invocation: &TestInvocation) -> WebhookResult<()>;

    /// Test invocations of a subscription, newest first.
    async fn list_test_invocations(&self, subscription_id: &str)
    -> WebhookResult<Vec<TestInvocation>>;
}

/// In-memory webhook storage.
///
/// Suitable for tests and single-process deployments.
pub struct InMemoryWebhookStorage {
    subscriptions: RwLock<HashMap<String, WebhookSubscription>>,
    public_ids: RwLock<HashMap<String, String>>,
    attempts: RwLock<Vec<DeliveryAttempt>>,
    jobs: RwLock<HashMap<String, RetryJob>>,
    test_invocations: RwLock<Vec<TestInvocation>>,
}

impl InMemoryWebhookStorage {
    /// Creates a new in-memory storage.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            public_ids: RwLock::new(HashMap::new()),
            attempts: RwLock::new(Vec::new()),
            jobs: RwLock::new(HashMap::new()),
            test_invocations: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryWebhookStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookStorage for InMemoryWebhookStorage {
    async fn save_subscription(&self, subscription: &WebhookSubscription) -> WebhookResult<()> {
        let mut public_ids = self.public_ids.write().await;
        if let Some(owner) = public_ids.get(&subscription.public_id) {
            if owner != &subscription.id {
                return Err(WebhookError::StorageError(format!(
                    "public id '{}' already in use",
                    subscription.public_id
                )));
            }
        }

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(previous) = subscriptions.get(&subscription.id) {
            if previous.public_id != subscription.public_id {
                public_ids.remove(&previous.public_id);
            }
        }
        public_ids.insert(subscription.public_id.clone(), subscription.id.clone());
        subscriptions.insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> WebhookResult<Option<WebhookSubscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions.get(id).cloned())
    }

    async fn find_by_public_id(
        &self,
        public_id: &str,
    ) -> WebhookResult<Option<WebhookSubscription>> {
        let id = match self.public_ids.read().await.get(public_id) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        self.get_subscription(&id).await
    }

    async fn list_subscriptions(&self, tenant_id: &str) -> WebhookResult<Vec<WebhookSubscription>> {
        let subscriptions = self.subscriptions.read().await;
        let mut found: Vec<_> = subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn matching_subscriptions(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> WebhookResult<Vec<WebhookSubscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|s| s.should_receive(tenant_id, event_type))
            .cloned()
            .collect())
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let mut attempts = self.attempts.write().await;
        if attempts.iter().any(|a| a.id == attempt.id) {
            return Err(WebhookError::StorageError(format!(
                "attempt {} already recorded",
                attempt.id
            )));
        }
        attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, query: &AttemptQuery) -> WebhookResult<Vec<DeliveryAttempt>> {
        let attempts = self.attempts.read().await;
        let matching = attempts.iter().rev().filter(|a| query.matches(a)).cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn attempts_for_correlation(
        &self,
        correlation_id: &str,
    ) -> WebhookResult<Vec<DeliveryAttempt>> {
        let attempts = self.attempts.read().await;
        let mut found: Vec<_> = attempts
            .iter()
            .filter(|a| a.correlation_id == correlation_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.attempt_number);
        Ok(found)
    }

    async fn insert_job(&self, job: &RetryJob) -> WebhookResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(WebhookError::StorageError(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> WebhookResult<Option<RetryJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(id).cloned())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> WebhookResult<Vec<RetryJob>> {
        let jobs = self.jobs.read().await;
        let mut due: Vec<_> = jobs.values().filter(|j| j.is_claimable(now)).cloned().collect();
        due.sort_by_key(|j| j.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_job(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> WebhookResult<Option<RetryJob>> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };

        if !job.is_claimable(now) {
            return Ok(None);
        }

        job.status = RetryJobStatus::InProgress;
        job.claimed_by = Some(worker_id.to_string());
        job.lease_expires_at = Some(lease_expires_at);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn finish_job(
        &self,
        id: &str,
        worker_id: &str,
        status: RetryJobStatus,
        now: DateTime<Utc>,
    ) -> WebhookResult<bool> {
        if !matches!(status, RetryJobStatus::Done | RetryJobStatus::Cancelled) {
            return Err(WebhookError::StorageError(format!(
                "cannot finish job with status {status:?}"
            )));
        }

        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };

        let owned = job.status == RetryJobStatus::InProgress
            && job.claimed_by.as_deref() == Some(worker_id);
        if !owned {
            return Ok(false);
        }

        job.status = status;
        job.lease_expires_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn cancel_pending_jobs(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> WebhookResult<usize> {
        let mut jobs = self.jobs.write().await;
        let mut cancelled = 0;
        for job in jobs.values_mut() {
            if job.subscription_id == subscription_id && job.status == RetryJobStatus::Pending {
                job.status = RetryJobStatus::Cancelled;
                job.updated_at = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn list_jobs(&self, query: &JobQuery) -> WebhookResult<Vec<RetryJob>> {
        let jobs = self.jobs.read().await;
        let mut found: Vec<_> = jobs.values().filter(|j| query.matches(j)).cloned().collect();
        found.sort_by_key(|j| j.scheduled_at);
        Ok(found)
    }

    async fn save_test_invocation(&self, invocation: &TestInvocation) -> WebhookResult<()> {
        let mut invocations = self.test_invocations.write().await;
        invocations.push(invocation.clone());
        Ok(())
    }

    async fn list_test_invocations(
        &self,
        subscription_id: &str,
    ) -> WebhookResult<Vec<TestInvocation>> {
        let invocations = self.test_invocations.read().await;
        Ok(invocations
            .iter()
            .rev()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}
