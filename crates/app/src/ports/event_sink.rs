//! Event sink port — durable append-only store of captured bus events.

use std::future::Future;
use std::sync::Arc;

use homebus_domain::error::HomeBusError;
use homebus_domain::event::Event;

/// Destination of events received by a bus client.
pub trait EventSink: Send + Sync {
    /// Append `events`.
    fn save(&self, events: Vec<Event>) -> impl Future<Output = Result<(), HomeBusError>> + Send;
}

impl<T: EventSink> EventSink for Arc<T> {
    fn save(&self, events: Vec<Event>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        (**self).save(events)
    }
}
