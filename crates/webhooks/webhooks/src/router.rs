//! Fan-out of internal events to matching subscriptions.

use std::sync::Arc;

use async_trait::async_trait;
use hookline_events::{Event, EventBus, EventError, EventHandler};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::{WebhookError, WebhookResult};
use crate::scheduler::RetryScheduler;
use crate::storage::WebhookStorage;

/// Handles to the delivery tasks started for one event.
///
/// Dropping it leaves the tasks running.
#[derive(Debug, Default)]
pub struct FanOut {
    handles: Vec<JoinHandle<()>>,
}

impl FanOut {
    /// Number of subscriptions the event went to.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no subscription matched.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every delivery task to finish its first attempt.
    pub async fn wait(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
    }
}

/// Routes events to the active subscriptions of the event's tenant.
#[derive(Clone)]
pub struct EventRouter {
    storage: Arc<dyn WebhookStorage>,
    dispatcher: Dispatcher,
    scheduler: Arc<RetryScheduler>,
}

impl EventRouter {
    /// Creates a router.
    pub fn new(
        storage: Arc<dyn WebhookStorage>,
        dispatcher: Dispatcher,
        scheduler: Arc<RetryScheduler>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            scheduler,
        }
    }

    /// Starts one delivery per matching subscription and returns without
    /// waiting for them.
    pub async fn trigger_event(
        &self,
        event_type: &str,
        payload: Value,
        tenant_id: &str,
    ) -> WebhookResult<FanOut> {
        self.route(event_type, payload, None, tenant_id).await
    }

    async fn route(
        &self,
        event_type: &str,
        payload: Value,
        metadata: Option<Value>,
        tenant_id: &str,
    ) -> WebhookResult<FanOut> {
        if tenant_id.is_empty() {
            return Err(WebhookError::InvalidPayload("tenant id is required".to_string()));
        }
        if event_type.is_empty() {
            return Err(WebhookError::InvalidPayload("event type is required".to_string()));
        }

        let subscriptions = self
            .storage
            .matching_subscriptions(tenant_id, event_type)
            .await?;

        if subscriptions.is_empty() {
            tracing::debug!(tenant_id, event_type, "No subscriptions for event");
            return Ok(FanOut::default());
        }

        tracing::debug!(
            tenant_id,
            event_type,
            subscriptions = subscriptions.len(),
            "Fanning out event"
        );

        let handles = subscriptions
            .into_iter()
            .map(|subscription| {
                let dispatcher = self.dispatcher.clone();
                let scheduler = self.scheduler.clone();
                let request = DispatchRequest::initial(event_type, payload.clone())
                    .metadata(metadata.clone());

                tokio::spawn(async move {
                    let result = match dispatcher.deliver(&subscription, &request).await {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!(
                                subscription_id = %subscription.id,
                                correlation_id = %request.correlation_id,
                                error = %e,
                                "Failed to record delivery"
                            );
                            return;
                        }
                    };

                    if let Err(e) = scheduler.schedule(&subscription, &result).await {
                        tracing::error!(
                            subscription_id = %subscription.id,
                            correlation_id = %request.correlation_id,
                            error = %e,
                            "Failed to schedule retry"
                        );
                    }
                })
            })
            .collect();

        Ok(FanOut { handles })
    }

    /// Attaches the router to every event on `bus`.
    pub async fn connect_to_events(&self, bus: &EventBus) {
        bus.on_all(self.clone()).await;
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    fn id(&self) -> &str {
        "webhook-router"
    }

    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        self.route(
            &event.type_string(),
            event.payload.clone(),
            event.metadata.to_value(),
            &event.tenant_id,
        )
        .await
        .map_err(|e| EventError::HandlerFailed(e.to_string()))?;
        Ok(())
    }
}
