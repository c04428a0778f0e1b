//! Event sink that only logs.
//!
//! Used by processes that observe the bus without a database, such as
//! device agents.

use std::future::Future;

use homebus_domain::error::HomeBusError;
use homebus_domain::event::Event;

use crate::ports::EventSink;

/// Logs each received event at `info` and discards it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn save(&self, events: Vec<Event>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        for event in &events {
            tracing::info!(
                owner = %event.owner,
                subject = event.subject().as_deref().unwrap_or_default(),
                content = %event.content,
                "bus event"
            );
        }
        async { Ok(()) }
    }
}
