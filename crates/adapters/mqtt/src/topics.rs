//! Topic mapping between bus routing keys and MQTT topics.
//!
//! Broadcasts live under `{base}/broadcast/`, the subject's `.`-separated
//! words becoming topic levels. Reply addresses live under `{base}/reply/`.

use homebus_domain::message::BusMessage;

const BROADCAST_LEVEL: &str = "broadcast";
const REPLY_LEVEL: &str = "reply";
const COMMAND_LEVEL: &str = "command";
const DEFAULT_PORT: u16 = 1883;

/// Builds the MQTT topics used under one base topic.
#[derive(Debug, Clone)]
pub struct TopicMap {
    base: String,
}

impl TopicMap {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_matches('/').to_string(),
        }
    }

    /// Topic a broadcast message is published under. Messages without a
    /// subject share the command topic.
    #[must_use]
    pub fn broadcast_topic(&self, message: &BusMessage) -> String {
        let key = message.subject().unwrap_or(COMMAND_LEVEL);
        format!("{}/{BROADCAST_LEVEL}/{}", self.base, key.replace('.', "/"))
    }

    /// MQTT filter equivalent to a bus subscription pattern.
    #[must_use]
    pub fn broadcast_filter(&self, pattern: &str) -> String {
        let levels: Vec<&str> = pattern
            .split('.')
            .map(|word| if word == "*" { "+" } else { word })
            .collect();
        format!("{}/{BROADCAST_LEVEL}/{}", self.base, levels.join("/"))
    }

    /// A fresh reply topic owned by `client_id`.
    #[must_use]
    pub fn reply_topic(&self, client_id: &str) -> String {
        format!(
            "{}/{REPLY_LEVEL}/{client_id}-{}",
            self.base,
            uuid::Uuid::new_v4().simple()
        )
    }
}

/// Whether `topic` matches the MQTT `filter` (`+` one level, `#` the rest).
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter = filter.split('/');
    let mut topic = topic.split('/');
    loop {
        match (filter.next(), topic.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Split a bus address into broker host and port.
///
/// Accepts `host`, `host:port` and the same prefixed with `mqtt://`.
pub fn parse_address(address: &str) -> Option<(String, u16)> {
    let address = address.trim();
    let address = address.strip_prefix("mqtt://").unwrap_or(address);
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (address, DEFAULT_PORT),
    };
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some((host.to_string(), port))
}
