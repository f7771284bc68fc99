//! Event emitter trait for business subsystems.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::event::Event;

/// Trait for types that raise domain events.
pub trait EventEmitter: Send + Sync {
    /// Returns a reference to the event bus.
    fn event_bus(&self) -> &EventBus;

    /// Emits an event (fire and forget).
    fn emit(&self, event: Event) -> impl std::future::Future<Output = ()> + Send {
        async move {
            self.event_bus().emit(event).await;
        }
    }

    /// Raises `event_type` for `tenant_id` with the given payload.
    ///
    /// This is the call every business module makes on a domain event, e.g.
    /// `trigger("invoice.paid", &invoice, &tenant)`. It never waits on
    /// webhook delivery.
    fn trigger(
        &self,
        event_type: impl Into<String>,
        payload: impl serde::Serialize,
        tenant_id: impl Into<String>,
    ) -> impl std::future::Future<Output = ()> + Send {
        let event = Event::simple(event_type, tenant_id, payload);
        async move {
            self.event_bus().emit(event).await;
        }
    }
}

/// A shared event emitter that can be cloned into every subsystem.
#[derive(Clone)]
pub struct SharedEventEmitter {
    bus: Arc<EventBus>,
    source: Option<String>,
}

impl SharedEventEmitter {
    /// Creates a new shared event emitter.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, source: None }
    }

    /// Returns an emitter that stamps events with the given source.
    pub fn for_source(&self, source: impl Into<String>) -> Self {
        Self {
            bus: self.bus.clone(),
            source: Some(source.into()),
        }
    }

    /// Builds an event stamped with this emitter's source.
    pub fn build(
        &self,
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: impl serde::Serialize,
    ) -> Event {
        let event = Event::simple(event_type, tenant_id, payload);
        match &self.source {
            Some(source) => event.with_source(source),
            None => event,
        }
    }

    /// Returns the Arc to the event bus.
    pub fn bus_arc(&self) -> Arc<EventBus> {
        self.bus.clone()
    }
}

impl EventEmitter for SharedEventEmitter {
    fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    fn trigger(
        &self,
        event_type: impl Into<String>,
        payload: impl serde::Serialize,
        tenant_id: impl Into<String>,
    ) -> impl std::future::Future<Output = ()> + Send {
        let event = self.build(event_type, tenant_id, payload);
        async move {
            self.bus.emit(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stamps_source() {
        let emitter = SharedEventEmitter::new(Arc::new(EventBus::new())).for_source("billing");
        let event = emitter.build("invoice.paid", "tenant-9", serde_json::json!({"total": 10}));

        assert_eq!(event.metadata.source, "billing");
        assert_eq!(event.tenant_id, "tenant-9");
        assert_eq!(event.type_string(), "invoice.paid");
    }
}
