//! Error kinds raised by the application layer.
//!
//! Callers distinguish a retryable [`BusClientError::CommandTimeout`] from a
//! dead client ([`BusClientError::Connection`]) by variant, never by message.

use std::time::Duration;

use homebus_domain::error::HomeBusError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure reported by a [`BusTransport`](crate::ports::BusTransport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("unable to connect to {address}")]
    Connection {
        address: String,
        #[source]
        source: BoxError,
    },

    /// The transport was closed.
    #[error("transport closed")]
    Closed,

    /// An inbound frame could not be decoded into a bus message.
    #[error("malformed bus message")]
    Decode(#[source] BoxError),

    /// Writing to the underlying connection failed.
    #[error("unable to send bus message")]
    Send(#[source] BoxError),
}

impl TransportError {
    pub fn connection(address: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Connection {
            address: address.into(),
            source: source.into(),
        }
    }

    pub fn decode(source: impl Into<BoxError>) -> Self {
        Self::Decode(source.into())
    }

    pub fn send(source: impl Into<BoxError>) -> Self {
        Self::Send(source.into())
    }
}

/// Failure of a [`BusClient`](crate::bus_client::BusClient) operation.
#[derive(Debug, thiserror::Error)]
pub enum BusClientError {
    /// The client could not connect; this instance is unusable.
    #[error("bus connection failed")]
    Connection(#[source] TransportError),

    /// The client is not in the `Connected` state.
    #[error("bus client is not connected")]
    NotConnected,

    /// No reply arrived within the command timeout.
    #[error("no reply within {0:?}")]
    CommandTimeout(Duration),

    /// Sending failed; the connection itself may still be usable.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure raised by a [`CommandListener`](crate::dispatch::CommandListener).
///
/// Logged at the dispatch site, never propagated out of the event loop.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),

    #[error("listener panicked: {0}")]
    Panicked(String),
}

impl ListenerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Failure of an inventory synchronisation run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The `inventory` command failed or timed out.
    #[error("inventory command failed")]
    Command(#[from] BusClientError),

    /// The reply could not be read as an inventory snapshot.
    #[error("invalid inventory snapshot")]
    Snapshot(#[from] serde_json::Error),

    /// Loading or saving the element tree failed.
    #[error("element store failed")]
    Storage(#[from] HomeBusError),
}
