//! Bus transport port — publish/subscribe with temporary reply addresses.
//!
//! A transport carries [`BusMessage`]s between the controller and the devices.
//! It offers broadcast publishing, wildcard subscriptions, and per-client
//! reply addresses that only the creating client reads from.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use homebus_domain::message::{BusMessage, ReplyAddress};

use crate::error::TransportError;

/// Stream of inbound messages; decode failures are delivered as errors.
pub type Inbound = mpsc::Receiver<Result<BusMessage, TransportError>>;

/// Pattern matching every broadcast message.
///
/// Patterns use `.`-separated words, `*` matching one word and `#` matching
/// any number of words.
pub const BROADCAST_PATTERN: &str = "#";

/// Login used when opening a transport connection.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One open connection to the bus.
pub trait BusTransport: Send + Sync + 'static {
    /// Broadcast a message. Events are routed by subject, commands go to the
    /// shared command route.
    fn publish(
        &self,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Deliver a message to a reply address.
    fn send_to(
        &self,
        address: &ReplyAddress,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive every broadcast message matching `pattern`.
    fn subscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Inbound, TransportError>> + Send;

    /// Allocate a temporary reply address scoped to this connection.
    fn create_reply_address(
        &self,
    ) -> impl Future<Output = Result<(ReplyAddress, Inbound), TransportError>> + Send;

    /// Tear the connection down. Open inbound streams end.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl<T: BusTransport> BusTransport for Arc<T> {
    fn publish(
        &self,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).publish(message)
    }

    fn send_to(
        &self,
        address: &ReplyAddress,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).send_to(address, message)
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Inbound, TransportError>> + Send {
        (**self).subscribe(pattern)
    }

    fn create_reply_address(
        &self,
    ) -> impl Future<Output = Result<(ReplyAddress, Inbound), TransportError>> + Send {
        (**self).create_reply_address()
    }

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).close()
    }
}

/// Opens [`BusTransport`] connections.
pub trait BusConnector: Send + Sync {
    type Transport: BusTransport;

    /// Connect to the bus at `address`.
    fn connect(
        &self,
        credentials: &Credentials,
        address: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

impl<C: BusConnector> BusConnector for Arc<C> {
    type Transport = C::Transport;

    fn connect(
        &self,
        credentials: &Credentials,
        address: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send {
        (**self).connect(credentials, address)
    }
}
