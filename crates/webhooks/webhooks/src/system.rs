//! Webhook system - main entry point.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use hookline_events::EventBus;

use crate::clock::{Clock, SystemClock};
use crate::delivery::{DeliveryAttempt, DeliveryResult, DeliveryStatus, RetryJob, TestInvocation};
use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::{WebhookError, WebhookResult};
use crate::harness::TestHarness;
use crate::recorder::{DeliveryRecorder, DeliveryStats, FailedDelivery};
use crate::retry::{BackoffConfig, MAX_RETRY_DELAY_SECS};
use crate::router::{EventRouter, FanOut};
use crate::scheduler::RetryScheduler;
use crate::storage::{AttemptQuery, InMemoryWebhookStorage, JobQuery, WebhookStorage};
use crate::subscription::WebhookSubscription;

/// Webhook system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// `User-Agent` sent with every delivery.
    pub user_agent: String,
    /// `X-Event-Source` sent with every delivery.
    pub event_source: String,
    /// Retry workers started by [`WebhookSystem::start_workers`].
    pub worker_count: usize,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Due jobs picked up per poll.
    pub batch_size: usize,
    /// How much longer than the request timeout a claim lasts.
    pub lease_margin_secs: u64,
    /// Cap on a receiver's `Retry-After`.
    pub max_retry_after_secs: u64,
    /// Backoff between retries.
    pub backoff: BackoffConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("hookline/{}", env!("CARGO_PKG_VERSION")),
            event_source: "hookline".to_string(),
            worker_count: 4,
            poll_interval_ms: 1000,
            batch_size: 50,
            lease_margin_secs: 30,
            max_retry_after_secs: 3600,
            backoff: BackoffConfig::default(),
        }
    }
}

impl WebhookConfig {
    /// Creates a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the event source.
    pub fn event_source(mut self, source: impl Into<String>) -> Self {
        self.event_source = source.into();
        self
    }

    /// Sets the worker count.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the poll interval.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the lease margin.
    pub fn lease_margin_secs(mut self, secs: u64) -> Self {
        self.lease_margin_secs = secs;
        self
    }

    /// Sets the `Retry-After` cap.
    pub fn max_retry_after_secs(mut self, secs: u64) -> Self {
        self.max_retry_after_secs = secs;
        self
    }

    /// Sets the backoff strategy.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> WebhookResult<()> {
        if self.worker_count == 0 {
            return Err(WebhookError::ConfigError("worker_count must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(WebhookError::ConfigError("batch_size must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(WebhookError::ConfigError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.lease_margin_secs == 0 {
            return Err(WebhookError::ConfigError(
                "lease_margin_secs must be greater than zero".to_string(),
            ));
        }

        let mut delays = vec![
            ("lease_margin_secs", self.lease_margin_secs),
            ("max_retry_after_secs", self.max_retry_after_secs),
        ];
        if let BackoffConfig::Exponential { max_delay_secs } = self.backoff {
            delays.push(("max_delay_secs", max_delay_secs));
        }
        for (name, secs) in delays {
            if secs > MAX_RETRY_DELAY_SECS {
                return Err(WebhookError::ConfigError(format!(
                    "{name} must be at most {MAX_RETRY_DELAY_SECS}"
                )));
            }
        }
        Ok(())
    }
}

/// The main webhook system.
///
/// Owns every component and is the admin surface: subscription management,
/// event triggering, test deliveries and delivery history.
pub struct WebhookSystem {
    config: WebhookConfig,
    instance_id: String,
    storage: Arc<dyn WebhookStorage>,
    clock: Arc<dyn Clock>,
    recorder: DeliveryRecorder,
    dispatcher: Dispatcher,
    scheduler: Arc<RetryScheduler>,
    router: EventRouter,
    harness: TestHarness,
}

impl WebhookSystem {
    /// Creates an in-memory system with the default configuration.
    pub fn new() -> WebhookResult<Self> {
        Self::with_config(WebhookConfig::default())
    }

    /// Creates an in-memory system with a custom configuration.
    pub fn with_config(config: WebhookConfig) -> WebhookResult<Self> {
        Self::with_storage(config, Arc::new(InMemoryWebhookStorage::new()), Arc::new(SystemClock))
    }

    /// Creates a system over the given storage and clock.
    pub fn with_storage(
        config: WebhookConfig,
        storage: Arc<dyn WebhookStorage>,
        clock: Arc<dyn Clock>,
    ) -> WebhookResult<Self> {
        config.validate()?;

        let recorder = DeliveryRecorder::new(storage.clone());
        let dispatcher = Dispatcher::new(recorder.clone(), clock.clone())?
            .user_agent(config.user_agent.clone())
            .event_source(config.event_source.clone());
        let scheduler = Arc::new(
            RetryScheduler::new(storage.clone(), dispatcher.clone(), clock.clone())
                .strategy(config.backoff.build())
                .max_retry_after(Duration::from_secs(config.max_retry_after_secs))
                .lease_margin(Duration::from_secs(config.lease_margin_secs))
                .batch_size(config.batch_size)
                .poll_interval(Duration::from_millis(config.poll_interval_ms)),
        );
        let router = EventRouter::new(storage.clone(), dispatcher.clone(), scheduler.clone());
        let harness = TestHarness::new(storage.clone(), dispatcher.clone(), recorder.clone(), clock.clone());

        let instance_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        Ok(Self {
            config,
            instance_id,
            storage,
            clock,
            recorder,
            dispatcher,
            scheduler,
            router,
            harness,
        })
    }

    // ==================== Subscriptions ====================

    /// Validates and stores a new subscription.
    pub async fn register_subscription(
        &self,
        subscription: WebhookSubscription,
    ) -> WebhookResult<WebhookSubscription> {
        subscription.validate()?;

        if self.storage.get_subscription(&subscription.id).await?.is_some() {
            return Err(WebhookError::InvalidSubscription(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }

        self.storage.save_subscription(&subscription).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            tenant_id = %subscription.tenant_id,
            url = %subscription.url,
            "Subscription registered"
        );
        Ok(subscription)
    }

    /// Replaces a subscription's settings.
    ///
    /// Identity, tenant and creation time are kept from the stored record.
    /// Turning `active` off cancels pending retries.
    pub async fn update_subscription(
        &self,
        mut subscription: WebhookSubscription,
    ) -> WebhookResult<WebhookSubscription> {
        let existing = self.require_subscription(&subscription.id).await?;
        if existing.tenant_id != subscription.tenant_id {
            return Err(WebhookError::InvalidSubscription(
                "tenant of a subscription cannot change".to_string(),
            ));
        }

        subscription.validate()?;
        subscription.public_id = existing.public_id;
        subscription.created_at = existing.created_at;
        subscription.updated_at = self.clock.now();
        self.storage.save_subscription(&subscription).await?;

        if existing.active && !subscription.active {
            self.scheduler.cancel_for_subscription(&subscription.id).await?;
        }

        tracing::info!(subscription_id = %subscription.id, "Subscription updated");
        Ok(subscription)
    }

    /// Soft-deletes a subscription and cancels its pending retries.
    ///
    /// Returns the number of retries cancelled.
    pub async fn deactivate_subscription(&self, id: &str) -> WebhookResult<usize> {
        let mut subscription = self.require_subscription(id).await?;
        if subscription.active {
            subscription.active = false;
            subscription.updated_at = self.clock.now();
            self.storage.save_subscription(&subscription).await?;
            tracing::info!(subscription_id = id, "Subscription deactivated");
        }

        self.scheduler.cancel_for_subscription(id).await
    }

    /// Gets a subscription by ID.
    pub async fn get_subscription(&self, id: &str) -> WebhookResult<Option<WebhookSubscription>> {
        self.storage.get_subscription(id).await
    }

    /// Gets a subscription by its public id.
    pub async fn find_by_public_id(&self, public_id: &str) -> WebhookResult<Option<WebhookSubscription>> {
        self.storage.find_by_public_id(public_id).await
    }

    /// Lists a tenant's subscriptions.
    pub async fn list_subscriptions(&self, tenant_id: &str) -> WebhookResult<Vec<WebhookSubscription>> {
        self.storage.list_subscriptions(tenant_id).await
    }

    async fn require_subscription(&self, id: &str) -> WebhookResult<WebhookSubscription> {
        self.storage
            .get_subscription(id)
            .await?
            .ok_or_else(|| WebhookError::SubscriptionNotFound(id.to_string()))
    }

    // ==================== Delivery ====================

    /// Fans an event out to the tenant's matching subscriptions.
    pub async fn trigger_event(
        &self,
        event_type: &str,
        payload: Value,
        tenant_id: &str,
    ) -> WebhookResult<FanOut> {
        self.router.trigger_event(event_type, payload, tenant_id).await
    }

    /// Sends a one-off test delivery.
    pub async fn test_delivery(
        &self,
        subscription_id: &str,
        event_type: &str,
        sample_data: Value,
    ) -> WebhookResult<TestInvocation> {
        self.harness
            .test_delivery(subscription_id, event_type, sample_data)
            .await
    }

    /// Re-sends a terminally failed or abandoned delivery as a new delivery.
    ///
    /// The new delivery gets its own correlation id and starts at attempt 1
    /// with the full retry budget.
    pub async fn retrigger_failed(&self, correlation_id: &str) -> WebhookResult<DeliveryResult> {
        let attempts = self.recorder.attempts_for_correlation(correlation_id).await?;
        let last = attempts
            .last()
            .ok_or_else(|| WebhookError::DeliveryNotFound(correlation_id.to_string()))?;

        let abandoned = last.status == DeliveryStatus::Retrying
            && !self.recorder.has_open_retry(correlation_id).await?;
        if last.status != DeliveryStatus::Failed && !abandoned {
            return Err(WebhookError::NotRetriggerable(correlation_id.to_string()));
        }

        let subscription = self.require_subscription(&last.subscription_id).await?;
        if !subscription.active {
            return Err(WebhookError::InvalidSubscription(format!(
                "subscription {} is inactive",
                subscription.id
            )));
        }

        let request = DispatchRequest::initial(last.event_type.clone(), last.payload.clone())
            .metadata(last.metadata.clone());
        tracing::info!(
            correlation_id,
            new_correlation_id = %request.correlation_id,
            subscription_id = %subscription.id,
            "Re-triggering failed delivery"
        );

        let result = self.dispatcher.deliver(&subscription, &request).await?;
        self.scheduler.schedule(&subscription, &result).await?;
        Ok(result)
    }

    /// Routes every event emitted on `bus` through this system.
    pub async fn connect_to_events(&self, bus: &EventBus) {
        self.router.connect_to_events(bus).await;
    }

    // ==================== Retries ====================

    /// Starts `worker_count` retry workers.
    pub fn start_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|n| {
                self.scheduler
                    .clone()
                    .spawn_worker(format!("{}-{n}", self.instance_id), shutdown.clone())
            })
            .collect()
    }

    /// Runs due retries once on behalf of `worker_id`.
    pub async fn run_due_retries(&self, worker_id: &str) -> WebhookResult<usize> {
        self.scheduler.run_due(worker_id).await
    }

    // ==================== History ====================

    /// Lists attempts, newest first.
    pub async fn attempts(&self, query: &AttemptQuery) -> WebhookResult<Vec<DeliveryAttempt>> {
        self.recorder.attempts(query).await
    }

    /// All attempts of one delivery, oldest first.
    pub async fn attempts_for_correlation(
        &self,
        correlation_id: &str,
    ) -> WebhookResult<Vec<DeliveryAttempt>> {
        self.recorder.attempts_for_correlation(correlation_id).await
    }

    /// Lists retry jobs.
    pub async fn retry_jobs(&self, query: &JobQuery) -> WebhookResult<Vec<RetryJob>> {
        self.storage.list_jobs(query).await
    }

    /// Test invocations of a subscription.
    pub async fn test_invocations(&self, subscription_id: &str) -> WebhookResult<Vec<TestInvocation>> {
        self.recorder.test_invocations(subscription_id).await
    }

    /// Delivery counters of a subscription.
    pub async fn stats(&self, subscription_id: &str) -> WebhookResult<DeliveryStats> {
        self.recorder.stats(subscription_id).await
    }

    /// Terminally failed deliveries, optionally for one subscription.
    pub async fn failed_deliveries(
        &self,
        subscription_id: Option<&str>,
    ) -> WebhookResult<Vec<FailedDelivery>> {
        self.recorder.failed_deliveries(subscription_id).await
    }

    /// Gets the configuration.
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }
}
