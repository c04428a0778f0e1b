//! MQTT adapter error types.

use std::time::Duration;

use homebus_app::error::TransportError;

/// Errors specific to the MQTT adapter.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// The bus address is not `[mqtt://]host[:port]`.
    #[error("invalid broker address {0:?}")]
    InvalidAddress(String),

    /// The broker did not accept the connection in time.
    #[error("broker did not answer within {0:?}")]
    ConnectTimeout(Duration),

    /// The connection to the broker failed.
    #[error("MQTT connection error")]
    Connection(#[source] rumqttc::ConnectionError),

    /// The rumqttc client returned an error.
    #[error("MQTT client error")]
    Client(#[source] rumqttc::ClientError),
}

impl MqttError {
    /// Convert into a [`TransportError`] for propagation across port
    /// boundaries; connection-time failures carry the broker `address`.
    pub fn into_transport(self, address: &str) -> TransportError {
        match self {
            Self::Client(_) => TransportError::send(self),
            other => TransportError::connection(address, other),
        }
    }
}
