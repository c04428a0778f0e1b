//! Event — a raw bus event captured for later processing.
//!
//! The bus client appends events; a downstream processor (not part of this
//! workspace) reads unprocessed ones and sets `processed`/`processing_error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{EventId, OwnerId};
use crate::message::BusMessage;
use crate::time::{Timestamp, now};

/// Payload key under which the event subject is stored in [`Event::content`].
pub const SUBJECT_KEY: &str = "event";

/// A captured bus event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub owner: OwnerId,
    /// JSON object: the message payload plus the subject under [`SUBJECT_KEY`].
    pub content: String,
    pub created: Timestamp,
    pub processed: Option<Timestamp>,
    pub processing_error: bool,
}

impl Event {
    /// Capture a received event message for `owner`.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the payload cannot be encoded.
    pub fn capture(owner: OwnerId, message: &BusMessage) -> Result<Self, serde_json::Error> {
        let mut content = message.payload().clone();
        if let Some(subject) = message.subject() {
            content.insert(SUBJECT_KEY.to_string(), Value::from(subject));
        }
        Ok(Self {
            id: EventId::new(),
            owner,
            content: serde_json::to_string(&content)?,
            created: now(),
            processed: None,
            processing_error: false,
        })
    }

    /// Subject recorded at capture time.
    #[must_use]
    pub fn subject(&self) -> Option<String> {
        serde_json::from_str::<Value>(&self.content)
            .ok()?
            .get(SUBJECT_KEY)?
            .as_str()
            .map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DEVICE_ID_KEY;
    use serde_json::json;

    #[test]
    fn should_capture_payload_with_subject() {
        let owner = OwnerId::new();
        let message = BusMessage::event("event.environment.temperaturechanged")
            .field(DEVICE_ID_KEY, "D1")
            .field("level", "21.5")
            .build();

        let event = Event::capture(owner, &message).unwrap();

        assert_eq!(event.owner, owner);
        assert!(event.processed.is_none());
        assert!(!event.processing_error);
        let content: Value = serde_json::from_str(&event.content).unwrap();
        assert_eq!(
            content,
            json!({
                "uuid": "D1",
                "level": "21.5",
                "event": "event.environment.temperaturechanged"
            })
        );
        assert_eq!(
            event.subject().as_deref(),
            Some("event.environment.temperaturechanged")
        );
    }
}
