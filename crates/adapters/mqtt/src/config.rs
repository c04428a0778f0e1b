//! MQTT transport configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the MQTT transport.
///
/// The broker itself is not configured here: every bus carries its own
/// `host:port` address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Prefix of the MQTT client identifier; a random suffix keeps
    /// concurrent connections apart.
    pub client_id_prefix: String,
    /// Base topic prefix for all homebus MQTT communication.
    pub base_topic: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// How long to wait for the broker to accept the connection, in seconds.
    pub connect_timeout_secs: u16,
    /// Capacity of the request queue and of every subscription channel.
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "homebus".to_string(),
            base_topic: "homebus".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 5,
            channel_capacity: 64,
        }
    }
}

impl MqttConfig {
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connect_timeout_secs))
    }
}
