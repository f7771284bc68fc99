//! Domain event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A domain event raised by a business subsystem for a single tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event occurrence.
    pub id: String,
    /// The event type (e.g. `order.created`).
    pub event_type: EventType,
    /// Tenant that owns the event. Routing never crosses this boundary.
    pub tenant_id: String,
    /// The event payload.
    pub payload: Value,
    /// Event metadata.
    pub metadata: EventMetadata,
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates a new event for a tenant.
    pub fn new(event_type: EventType, tenant_id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            tenant_id: tenant_id.into(),
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            metadata: EventMetadata::default(),
            timestamp: Utc::now(),
        }
    }

    /// Creates an event from a dotted type string (e.g. `"invoice.paid"`).
    pub fn simple(
        event_type: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: impl Serialize,
    ) -> Self {
        Self::new(EventType::from_string(event_type), tenant_id, payload)
    }

    /// Sets the emitting subsystem.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = source.into();
        self
    }

    /// Adds a tag to the event metadata.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.tags.insert(key.into(), value.into());
        self
    }

    /// Returns the dotted type string.
    pub fn type_string(&self) -> String {
        self.event_type.to_string()
    }

    /// Deserializes the payload to a specific type.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Event type identifier: a namespace and a name, written `namespace.name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventType {
    /// Namespace (e.g. "order", "invoice").
    pub namespace: String,
    /// Event name (e.g. "created", "paid"). May itself contain dots.
    pub name: String,
}

impl EventType {
    /// Creates a new event type.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `"order.created"` or `"work_order.status.changed"`.
    ///
    /// Everything after the first dot is the name.
    pub fn from_string(s: impl Into<String>) -> Self {
        let s = s.into();
        match s.split_once('.') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new("unknown", s),
        }
    }

    /// Checks if this event type matches a pattern.
    ///
    /// Patterns are an exact type, a namespace wildcard (`order.*`) or `*`.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self.namespace == prefix;
        }

        self.to_string() == pattern
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Metadata associated with an event.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventMetadata {
    /// Subsystem that emitted the event.
    pub source: String,
    /// Free-form tags.
    pub tags: HashMap<String, String>,
}

impl EventMetadata {
    /// Creates new metadata with a source.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tags: HashMap::new(),
        }
    }

    /// Returns the metadata as a JSON value, or `None` when it carries nothing.
    pub fn to_value(&self) -> Option<Value> {
        if self.source.is_empty() && self.tags.is_empty() {
            return None;
        }
        serde_json::to_value(self).ok()
    }
}
