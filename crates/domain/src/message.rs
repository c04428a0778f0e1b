//! Bus message — the unit exchanged on the shared publish/subscribe bus.
//!
//! A message is a flat mapping of string keys to JSON values plus an optional
//! `subject`. Messages whose subject starts with [`EVENT_PREFIX`] are events;
//! everything else is a command. Commands may carry a reply address where the
//! answer is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value content of a message.
pub type Payload = Map<String, Value>;

/// Subject prefix classifying a message as an event.
pub const EVENT_PREFIX: &str = "event.";

/// Payload key holding the command name.
pub const COMMAND_KEY: &str = "command";

/// Payload key holding the target device id.
pub const DEVICE_ID_KEY: &str = "uuid";

/// Payload key holding a device class, e.g. `"switch"`.
pub const DEVICE_TYPE_KEY: &str = "devicetype";

/// Payload key holding a display name.
pub const NAME_KEY: &str = "name";

/// Payload key set on acknowledgements.
pub const ACK_KEY: &str = "ack";

/// Command asking the bus for its room and device listing.
pub const COMMAND_INVENTORY: &str = "inventory";

/// Command asking the bus to store a device's display name.
pub const COMMAND_SET_DEVICE_NAME: &str = "setdevicename";

/// Subject of the announce event sent when a local device joins the bus.
pub const SUBJECT_DEVICE_ANNOUNCE: &str = "event.device.announce";

/// Subject of the event sent when a local device leaves the bus.
pub const SUBJECT_DEVICE_REMOVE: &str = "event.device.remove";

/// Periodic clock event, never persisted.
pub const SUBJECT_TIME_CHANGED: &str = "event.environment.timechanged";

/// Whether `payload` holds nothing but the acknowledgement flag.
#[must_use]
pub fn is_acknowledgement_payload(payload: &Payload) -> bool {
    payload.len() == 1 && payload.get(ACK_KEY) == Some(&Value::Bool(true))
}

/// Temporary address where replies to a command are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyAddress(String);

impl ReplyAddress {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable bus message.
///
/// Build outbound messages with [`BusMessage::builder`]; inbound messages are
/// produced by transports and only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<ReplyAddress>,
    #[serde(default)]
    content: Payload,
}

impl BusMessage {
    /// Create a builder for an outbound message.
    #[must_use]
    pub fn builder() -> BusMessageBuilder {
        BusMessageBuilder::default()
    }

    /// Start a command message with the given command name.
    #[must_use]
    pub fn command(name: impl Into<String>) -> BusMessageBuilder {
        Self::builder().field(COMMAND_KEY, name.into())
    }

    /// Start an event message with the given subject.
    #[must_use]
    pub fn event(subject: impl Into<String>) -> BusMessageBuilder {
        Self::builder().subject(subject)
    }

    /// Minimal reply telling a command sender that the command was seen.
    #[must_use]
    pub fn acknowledgement() -> Self {
        Self::builder().field(ACK_KEY, true).build()
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&ReplyAddress> {
        self.reply_to.as_ref()
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.content
    }

    /// Consume the message, keeping only its payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        self.content
    }

    /// Read a string field from the payload.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// Command name, if any.
    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        self.get_str(COMMAND_KEY)
    }

    /// Target device id, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.get_str(DEVICE_ID_KEY)
    }

    /// Whether the subject classifies this message as an event.
    #[must_use]
    pub fn is_event(&self) -> bool {
        self.subject
            .as_deref()
            .is_some_and(|subject| subject.starts_with(EVENT_PREFIX))
    }

    /// Whether this message is an acknowledgement rather than a real reply.
    #[must_use]
    pub fn is_acknowledgement(&self) -> bool {
        is_acknowledgement_payload(&self.content)
    }

    /// Encode into the JSON envelope used by byte-oriented transports.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if a payload value cannot be encoded.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the JSON envelope used by byte-oriented transports.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] when the bytes are not a valid envelope.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Step-by-step builder for [`BusMessage`].
#[derive(Debug, Default)]
pub struct BusMessageBuilder {
    subject: Option<String>,
    reply_to: Option<ReplyAddress>,
    content: Payload,
}

impl BusMessageBuilder {
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: ReplyAddress) -> Self {
        self.reply_to = Some(address);
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.content.insert(key.into(), value.into());
        self
    }

    /// Copy every entry of `payload` into the message, overwriting duplicates.
    #[must_use]
    pub fn fields(mut self, payload: Payload) -> Self {
        self.content.extend(payload);
        self
    }

    #[must_use]
    pub fn build(self) -> BusMessage {
        BusMessage {
            subject: self.subject,
            reply_to: self.reply_to,
            content: self.content,
        }
    }
}
