//! Event bus for pub/sub communication between subsystems.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::error::{EventError, EventResult};
use crate::event::Event;
use crate::handler::{BoxedHandler, EventHandler, HandlerResult};

/// The event bus for publishing and subscribing to events.
pub struct EventBus {
    /// Subscribers mapped by event type pattern.
    subscribers: RwLock<HashMap<String, Vec<Arc<BoxedHandler>>>>,
    /// Wildcard subscribers (receive all events).
    wildcard_subscribers: RwLock<Vec<Arc<BoxedHandler>>>,
}

impl EventBus {
    /// Creates a new event bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            wildcard_subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to a specific event type or pattern.
    ///
    /// Patterns support:
    /// - Exact match: "order.created"
    /// - Namespace wildcard: "order.*"
    /// - All events: "*"
    pub async fn on(&self, pattern: &str, handler: impl EventHandler + 'static) {
        if pattern == "*" {
            self.on_all(handler).await;
        } else {
            let mut subs = self.subscribers.write().await;
            subs.entry(pattern.to_string())
                .or_default()
                .push(Arc::new(Box::new(handler)));
        }
    }

    /// Subscribes to all events.
    pub async fn on_all(&self, handler: impl EventHandler + 'static) {
        let mut subs = self.wildcard_subscribers.write().await;
        subs.push(Arc::new(Box::new(handler)));
    }

    /// Emits an event to all matching subscribers without waiting for them.
    ///
    /// Each handler runs on its own task, so a slow handler never holds up
    /// the emitter or the other handlers.
    pub async fn emit(&self, event: Event) {
        if let Err(e) = validate(&event) {
            tracing::error!(event_id = %event.id, "Dropping event: {}", e);
            return;
        }

        let handlers = self.collect_handlers(&event).await;
        let event = Arc::new(event);

        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    tracing::error!("Event handler '{}' error: {}", handler.id(), e);
                }
            });
        }
    }

    /// Emits an event and waits for all handlers to complete.
    pub async fn emit_sync(&self, event: Event) -> Vec<HandlerResult> {
        let mut results = Vec::new();

        if let Err(e) = validate(&event) {
            tracing::error!(event_id = %event.id, "Dropping event: {}", e);
            return results;
        }

        let handlers = self.collect_handlers(&event).await;

        for handler in handlers {
            let start = Instant::now();
            let result = handler.handle(&event).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            results.push(match result {
                Ok(()) => HandlerResult::success(handler.id(), duration_ms),
                Err(e) => HandlerResult::failure(handler.id(), e.to_string(), duration_ms),
            });
        }

        results
    }

    /// Gets the number of subscribers for a pattern.
    pub async fn subscriber_count(&self, pattern: &str) -> usize {
        if pattern == "*" {
            let subs = self.wildcard_subscribers.read().await;
            subs.len()
        } else {
            let subs = self.subscribers.read().await;
            subs.get(pattern).map(|v| v.len()).unwrap_or(0)
        }
    }

    /// Clears all subscribers.
    pub async fn clear_subscribers(&self) {
        self.subscribers.write().await.clear();
        self.wildcard_subscribers.write().await.clear();
    }

    async fn collect_handlers(&self, event: &Event) -> Vec<Arc<BoxedHandler>> {
        let mut handlers = Vec::new();

        let subs = self.subscribers.read().await;
        for (pattern, pattern_handlers) in subs.iter() {
            if event.event_type.matches(pattern) {
                handlers.extend(pattern_handlers.iter().cloned());
            }
        }

        let wildcards = self.wildcard_subscribers.read().await;
        handlers.extend(wildcards.iter().cloned());

        handlers
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(event: &Event) -> EventResult<()> {
    if event.tenant_id.is_empty() {
        return Err(EventError::InvalidEvent("missing tenant id".to_string()));
    }
    Ok(())
}
