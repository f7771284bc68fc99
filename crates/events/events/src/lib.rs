//! # Hookline Events
//!
//! Domain event plumbing shared by every business subsystem:
//! - Tenant-scoped events with dotted types (`order.created`)
//! - Pub/sub event bus with async, isolated handlers
//! - Emitter trait used to raise events without waiting on consumers
//!
//! ## Example
//!
//! ```rust,ignore
//! use hookline_events::{EventBus, EventEmitter, SharedEventEmitter};
//!
//! let bus = Arc::new(EventBus::new());
//! let emitter = SharedEventEmitter::new(bus.clone()).for_source("billing");
//!
//! emitter.trigger("invoice.paid", json!({ "invoice_id": 7 }), "tenant-1").await;
//! ```

mod bus;
mod emitter;
mod error;
mod event;
mod handler;

pub use bus::EventBus;
pub use emitter::{EventEmitter, SharedEventEmitter};
pub use error::{EventError, EventResult};
pub use event::{Event, EventMetadata, EventType};
pub use handler::{BoxedHandler, EventHandler, HandlerResult};
