//! Retry scheduling and the workers that execute retry jobs.
//!
//! A failed attempt that may be retried becomes one pending [`RetryJob`].
//! Workers poll for due jobs, claim each through
//! [`WebhookStorage::claim_job`], run the attempt, and close the job. A
//! further failure produces a new job for the next attempt number.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::delivery::{DeliveryResult, DeliveryStatus, RetryJob, RetryJobStatus};
use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::{DeliveryError, WebhookError, WebhookResult};
use crate::retry::{ExponentialBackoff, RetryStrategy, retry_delay};
use crate::storage::WebhookStorage;
use crate::subscription::WebhookSubscription;

/// Schedules and executes retries.
pub struct RetryScheduler {
    storage: Arc<dyn WebhookStorage>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    strategy: Arc<dyn RetryStrategy>,
    max_retry_after: Duration,
    lease_margin: Duration,
    batch_size: usize,
    poll_interval: Duration,
}

impl RetryScheduler {
    /// Creates a scheduler with exponential backoff.
    pub fn new(storage: Arc<dyn WebhookStorage>, dispatcher: Dispatcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            dispatcher,
            clock,
            strategy: Arc::new(ExponentialBackoff::new()),
            max_retry_after: Duration::from_secs(3600),
            lease_margin: Duration::from_secs(30),
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Sets the backoff strategy.
    pub fn strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the cap on receiver-requested delays.
    pub fn max_retry_after(mut self, max: Duration) -> Self {
        self.max_retry_after = max;
        self
    }

    /// Sets how much longer than the request timeout a claim lasts. At least
    /// one second.
    pub fn lease_margin(mut self, margin: Duration) -> Self {
        self.lease_margin = margin.max(Duration::from_secs(1));
        self
    }

    /// Sets how many due jobs one poll picks up.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the worker poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Creates the follow-up job for a recorded attempt, if it needs one.
    ///
    /// Attempts that ran out of retries are logged at `error`.
    pub async fn schedule(
        &self,
        subscription: &WebhookSubscription,
        result: &DeliveryResult,
    ) -> WebhookResult<Option<RetryJob>> {
        let attempt = &result.attempt;

        if !result.needs_retry() {
            if attempt.status == DeliveryStatus::Failed && attempt.retryable {
                let exhausted = DeliveryError::RetriesExhausted {
                    attempts: attempt.attempt_number,
                };
                tracing::error!(
                    subscription_id = %attempt.subscription_id,
                    correlation_id = %attempt.correlation_id,
                    attempts = attempt.attempt_number,
                    last_error = attempt.error.as_deref().unwrap_or_default(),
                    "{}",
                    exhausted
                );
            }
            return Ok(None);
        }

        let delay = retry_delay(
            self.strategy.as_ref(),
            subscription.retry_policy.base_delay(),
            attempt.attempt_number,
            result.retry_after(),
            self.max_retry_after,
        );
        let now = self.clock.now();
        let job = RetryJob::new(attempt, attempt.attempt_number + 1, after(now, delay)?, now);
        self.storage.insert_job(&job).await?;

        tracing::info!(
            subscription_id = %job.subscription_id,
            correlation_id = %job.correlation_id,
            attempt = job.attempt_number,
            delay_secs = delay.as_secs(),
            "Retry scheduled"
        );

        Ok(Some(job))
    }

    /// Runs every job due now. Returns how many this worker executed.
    pub async fn run_due(&self, worker_id: &str) -> WebhookResult<usize> {
        let due = self.storage.due_jobs(self.clock.now(), self.batch_size).await?;

        let mut executed = 0;
        for job in due {
            match self.run_job(&job, worker_id).await {
                Ok(true) => executed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    job_id = %job.id,
                    correlation_id = %job.correlation_id,
                    worker_id,
                    error = %e,
                    "Retry job failed"
                ),
            }
        }
        Ok(executed)
    }

    /// Claims and executes one job. Returns `false` if another worker holds it.
    async fn run_job(&self, job: &RetryJob, worker_id: &str) -> WebhookResult<bool> {
        let subscription = self.storage.get_subscription(&job.subscription_id).await?;

        let timeout = subscription
            .as_ref()
            .map(|s| s.retry_policy.timeout())
            .unwrap_or_default();
        let now = self.clock.now();
        let lease_until = after(now, timeout.saturating_add(self.lease_margin))?;

        let Some(job) = self
            .storage
            .claim_job(&job.id, worker_id, now, lease_until)
            .await?
        else {
            tracing::debug!(job_id = %job.id, worker_id, "Job claimed elsewhere");
            return Ok(false);
        };

        let subscription = match subscription {
            Some(sub) if sub.active => sub,
            _ => {
                self.storage
                    .finish_job(&job.id, worker_id, RetryJobStatus::Cancelled, self.clock.now())
                    .await?;
                tracing::info!(
                    job_id = %job.id,
                    subscription_id = %job.subscription_id,
                    "Retry cancelled, subscription inactive"
                );
                return Ok(true);
            }
        };

        // The policy may have been tightened since the job was scheduled.
        let max_attempts = subscription.retry_policy.max_attempts;
        if job.attempt_number > max_attempts {
            self.storage
                .finish_job(&job.id, worker_id, RetryJobStatus::Cancelled, self.clock.now())
                .await?;
            let exhausted = DeliveryError::RetriesExhausted {
                attempts: job.attempt_number - 1,
            };
            tracing::error!(
                job_id = %job.id,
                subscription_id = %job.subscription_id,
                correlation_id = %job.correlation_id,
                attempt = job.attempt_number,
                max_attempts,
                "{}",
                exhausted
            );
            return Ok(true);
        }

        let result = self
            .dispatcher
            .deliver(&subscription, &DispatchRequest::from_job(&job))
            .await?;

        let still_owned = self
            .storage
            .finish_job(&job.id, worker_id, RetryJobStatus::Done, self.clock.now())
            .await?;
        if !still_owned {
            // The lease lapsed mid-delivery; whoever holds it now schedules.
            tracing::warn!(job_id = %job.id, worker_id, "Lost claim before completion");
            return Ok(true);
        }

        self.schedule(&subscription, &result).await?;
        Ok(true)
    }

    /// Cancels every pending retry of a subscription.
    pub async fn cancel_for_subscription(&self, subscription_id: &str) -> WebhookResult<usize> {
        let cancelled = self
            .storage
            .cancel_pending_jobs(subscription_id, self.clock.now())
            .await?;
        if cancelled > 0 {
            tracing::info!(subscription_id, cancelled, "Pending retries cancelled");
        }
        Ok(cancelled)
    }

    /// Spawns a polling worker that stops when `shutdown` turns true or its
    /// sender is dropped.
    pub fn spawn_worker(
        self: Arc<Self>,
        worker_id: impl Into<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let worker_id = worker_id.into();

        tokio::spawn(async move {
            tracing::info!(worker_id = %worker_id, "Retry worker started");

            while !*shutdown.borrow() {
                match self.run_due(&worker_id).await {
                    Ok(0) => {}
                    Ok(executed) => tracing::debug!(worker_id = %worker_id, executed, "Retries executed"),
                    Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Retry poll failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!(worker_id = %worker_id, "Retry worker stopped");
        })
    }
}

/// `at + delay`, or an error when the result is not a representable time.
fn after(at: DateTime<Utc>, delay: Duration) -> WebhookResult<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| WebhookError::ConfigError(format!("delay out of range: {delay:?}")))
}
