//! In-process bus backed by tokio mpsc channels.
//!
//! Every connection opened on one [`InMemoryBus`] shares the same routing
//! table, the way clients of one broker do. Publishers receive their own
//! broadcasts if they subscribed to a matching pattern.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use homebus_domain::message::{BusMessage, ReplyAddress};

use crate::error::TransportError;
use crate::ports::{BusConnector, BusTransport, Credentials, Inbound};

/// Routing key of messages without a subject.
pub const COMMAND_ROUTING_KEY: &str = "command";

const DEFAULT_CAPACITY: usize = 64;

type Delivery = mpsc::Sender<Result<BusMessage, TransportError>>;

struct Subscription {
    connection: u64,
    pattern: String,
    sender: Delivery,
}

#[derive(Default)]
struct Hub {
    subscriptions: Vec<Subscription>,
    reply_queues: HashMap<ReplyAddress, (u64, Delivery)>,
    unreachable: HashSet<String>,
}

/// In-process broker.
///
/// Delivery never blocks: a subscriber whose channel is full misses the
/// message.
#[derive(Clone)]
pub struct InMemoryBus {
    hub: Arc<Mutex<Hub>>,
    capacity: usize,
    next_connection: Arc<AtomicU64>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus whose subscriber channels hold `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            capacity: capacity.max(1),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make connection attempts to `address` fail.
    pub fn mark_unreachable(&self, address: impl Into<String>) {
        self.hub().unreachable.insert(address.into());
    }

    /// Undo [`mark_unreachable`](Self::mark_unreachable).
    pub fn mark_reachable(&self, address: &str) {
        self.hub().unreachable.remove(address);
    }

    /// Hand every subscriber of `routing_key` a frame that failed to decode,
    /// as a broker relaying a corrupt message would.
    pub fn inject_malformed(&self, routing_key: &str) {
        for subscription in &self.hub().subscriptions {
            if pattern_matches(&subscription.pattern, routing_key) {
                let _ = subscription
                    .sender
                    .try_send(Err(TransportError::decode("corrupt frame")));
            }
        }
    }

    /// Like [`inject_malformed`](Self::inject_malformed), for one reply address.
    pub fn inject_malformed_reply(&self, address: &ReplyAddress) {
        if let Some((_, sender)) = self.hub().reply_queues.get(address) {
            let _ = sender.try_send(Err(TransportError::decode("corrupt frame")));
        }
    }

    /// Subscriptions and reply queues currently open on this bus.
    #[must_use]
    pub fn open_endpoints(&self) -> usize {
        let hub = self.hub();
        hub.subscriptions.len() + hub.reply_queues.len()
    }

    /// Open a connection directly, bypassing reachability checks.
    #[must_use]
    pub fn open(&self) -> InMemoryTransport {
        InMemoryTransport {
            bus: self.clone(),
            connection: self.next_connection.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }
}

impl BusConnector for InMemoryBus {
    type Transport = InMemoryTransport;

    fn connect(
        &self,
        _credentials: &Credentials,
        address: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send {
        let result = if self.hub().unreachable.contains(address) {
            Err(TransportError::connection(address, "bus unreachable"))
        } else {
            Ok(self.open())
        };
        async { result }
    }
}

/// One connection to an [`InMemoryBus`].
pub struct InMemoryTransport {
    bus: InMemoryBus,
    connection: u64,
    closed: AtomicBool,
}

impl InMemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn broadcast(&self, message: &BusMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        let routing_key = message.subject().unwrap_or(COMMAND_ROUTING_KEY);
        let mut hub = self.bus.hub();
        hub.subscriptions.retain(|subscription| {
            if !pattern_matches(&subscription.pattern, routing_key) {
                return true;
            }
            match subscription.sender.try_send(Ok(message.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(pattern = %subscription.pattern, "subscriber full, dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    fn deliver(&self, address: &ReplyAddress, message: BusMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut hub = self.bus.hub();
        let Some((_, sender)) = hub.reply_queues.get(address) else {
            tracing::debug!(%address, "no such reply address, dropping message");
            return Ok(());
        };
        match sender.try_send(Ok(message)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%address, "reply queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                hub.reply_queues.remove(address);
            }
        }
        Ok(())
    }

    fn open_subscription(&self, pattern: &str) -> Result<Inbound, TransportError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::channel(self.bus.capacity);
        self.bus.hub().subscriptions.push(Subscription {
            connection: self.connection,
            pattern: pattern.to_string(),
            sender,
        });
        Ok(receiver)
    }

    fn open_reply_queue(&self) -> Result<(ReplyAddress, Inbound), TransportError> {
        self.ensure_open()?;
        let address = ReplyAddress::new(format!("reply.{}", uuid::Uuid::new_v4()));
        let (sender, receiver) = mpsc::channel(self.bus.capacity);
        self.bus
            .hub()
            .reply_queues
            .insert(address.clone(), (self.connection, sender));
        Ok((address, receiver))
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut hub = self.bus.hub();
        hub.subscriptions
            .retain(|subscription| subscription.connection != self.connection);
        hub.reply_queues
            .retain(|_, (connection, _)| *connection != self.connection);
    }
}

impl BusTransport for InMemoryTransport {
    fn publish(
        &self,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = self.broadcast(&message);
        async { result }
    }

    fn send_to(
        &self,
        address: &ReplyAddress,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = self.deliver(address, message);
        async { result }
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Inbound, TransportError>> + Send {
        let result = self.open_subscription(pattern);
        async { result }
    }

    fn create_reply_address(
        &self,
    ) -> impl Future<Output = Result<(ReplyAddress, Inbound), TransportError>> + Send {
        let result = self.open_reply_queue();
        async { result }
    }

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.shutdown();
        async { Ok(()) }
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Match a `.`-separated routing key against a pattern where `*` matches
/// exactly one word and `#` matches zero or more words.
#[must_use]
pub fn pattern_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => words_match(rest, key_rest),
            _ => false,
        },
    }
}
