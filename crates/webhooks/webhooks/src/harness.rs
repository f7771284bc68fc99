//! Manual test deliveries.

use std::sync::Arc;

use serde_json::Value;

use crate::clock::Clock;
use crate::delivery::TestInvocation;
use crate::dispatcher::{DispatchRequest, Dispatcher};
use crate::error::{WebhookError, WebhookResult};
use crate::recorder::DeliveryRecorder;
use crate::storage::WebhookStorage;

/// Sends one-off test deliveries and records them apart from production
/// traffic. Never schedules a retry.
#[derive(Clone)]
pub struct TestHarness {
    storage: Arc<dyn WebhookStorage>,
    dispatcher: Dispatcher,
    recorder: DeliveryRecorder,
    clock: Arc<dyn Clock>,
}

impl TestHarness {
    /// Creates a harness.
    pub fn new(
        storage: Arc<dyn WebhookStorage>,
        dispatcher: Dispatcher,
        recorder: DeliveryRecorder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            recorder,
            clock,
        }
    }

    /// Delivers `sample_data` once and waits for the outcome.
    ///
    /// Works on inactive subscriptions, so an endpoint can be checked before
    /// it is enabled.
    pub async fn test_delivery(
        &self,
        subscription_id: &str,
        event_type: &str,
        sample_data: Value,
    ) -> WebhookResult<TestInvocation> {
        let subscription = self
            .storage
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| WebhookError::SubscriptionNotFound(subscription_id.to_string()))?;

        let request = DispatchRequest::initial(event_type, sample_data.clone());
        let outcome = self.dispatcher.send(&subscription, &request).await;

        let invocation = TestInvocation::from_outcome(
            &subscription,
            event_type,
            sample_data,
            &outcome,
            self.clock.now(),
        );
        self.recorder.record_test(&invocation).await?;

        tracing::info!(
            subscription_id,
            event_type,
            status = ?invocation.status,
            status_code = ?invocation.status_code,
            "Test delivery sent"
        );

        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::delivery::DeliveryStatus;
    use crate::storage::{AttemptQuery, InMemoryWebhookStorage, JobQuery};
    use crate::subscription::WebhookSubscription;
    use serde_json::json;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn harness(storage: Arc<InMemoryWebhookStorage>) -> TestHarness {
        let clock = Arc::new(SystemClock);
        let recorder = DeliveryRecorder::new(storage.clone());
        let dispatcher = Dispatcher::new(recorder.clone(), clock.clone()).unwrap();
        TestHarness::new(storage, dispatcher, recorder, clock)
    }

    #[tokio::test]
    async fn test_failed_test_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let storage = Arc::new(InMemoryWebhookStorage::new());
        let sub = WebhookSubscription::new("tenant-1", server.uri())
            .events(["order.created"])
            .inactive();
        storage.save_subscription(&sub).await.unwrap();

        let invocation = harness(storage.clone())
            .test_delivery(&sub.id, "order.created", json!({"sample": true}))
            .await
            .unwrap();

        assert_eq!(invocation.status, DeliveryStatus::Failed);
        assert_eq!(invocation.status_code, Some(503));
        assert_eq!(storage.list_test_invocations(&sub.id).await.unwrap().len(), 1);
        assert!(storage.list_jobs(&JobQuery::default()).await.unwrap().is_empty());
        assert!(storage.list_attempts(&AttemptQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_subscription() {
        let storage = Arc::new(InMemoryWebhookStorage::new());
        let err = harness(storage)
            .test_delivery("missing", "order.created", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::SubscriptionNotFound(_)));
    }
}
