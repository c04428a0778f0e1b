//! Bus client — one logical connection to the bus.
//!
//! The client multiplexes a single transport connection between:
//! - fire-and-forget events ([`BusClient::send_event`]),
//! - synchronous command/reply exchanges ([`BusClient::send_command`]),
//! - inbound commands dispatched to registered listeners.
//!
//! Two background loops run while connected. The event loop reads the
//! broadcast subscription, stores events through the [`EventSink`] and
//! answers inbound commands. The reply loop reads this client's reply address
//! and feeds the [`CorrelationChannel`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use homebus_domain::event::Event;
use homebus_domain::id::OwnerId;
use homebus_domain::message::{
    BusMessage, COMMAND_SET_DEVICE_NAME, DEVICE_ID_KEY, DEVICE_TYPE_KEY, NAME_KEY, Payload,
    ReplyAddress, SUBJECT_DEVICE_ANNOUNCE, SUBJECT_DEVICE_REMOVE, SUBJECT_TIME_CHANGED,
};

use crate::correlation::CorrelationChannel;
use crate::dispatch::CommandDispatchTable;
use crate::error::{BusClientError, TransportError};
use crate::ports::{BROADCAST_PATTERN, BusConnector, BusTransport, Credentials, EventSink, Inbound};

/// Lifecycle of a [`BusClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Tuning knobs of a [`BusClient`].
#[derive(Debug, Clone)]
pub struct BusClientOptions {
    /// Upper bound on waiting for the first reply to a command.
    pub command_timeout: Duration,
    /// After the first reply, how long later replies may still replace it.
    pub reply_grace: Duration,
    /// Unread replies kept before the oldest is dropped.
    pub reply_capacity: usize,
}

impl Default for BusClientOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            reply_grace: Duration::from_millis(500),
            reply_capacity: 10,
        }
    }
}

/// Issues commands and waits for their reply.
///
/// Implemented by [`BusClient`]; lets use-cases be exercised without a bus.
pub trait CommandSender: Send + Sync {
    /// Send a command built from `parameters` and return the reply payload.
    fn send_command(
        &self,
        parameters: Payload,
    ) -> impl Future<Output = Result<Payload, BusClientError>> + Send;
}

#[derive(Debug, Clone)]
struct KnownDevice {
    device_type: String,
    name: String,
}

/// Writes to the transport one message at a time.
struct Outbound<T> {
    transport: T,
    send_lock: tokio::sync::Mutex<()>,
}

impl<T: BusTransport> Outbound<T> {
    async fn publish(&self, message: BusMessage) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        self.transport.publish(message).await
    }

    async fn send_to(&self, address: &ReplyAddress, message: BusMessage) -> Result<(), TransportError> {
        let _guard = self.send_lock.lock().await;
        self.transport.send_to(address, message).await
    }
}

struct Session<T> {
    outbound: Arc<Outbound<T>>,
    reply_address: ReplyAddress,
}

/// A connection to the bus with command correlation and listener dispatch.
pub struct BusClient<T> {
    options: BusClientOptions,
    listeners: Arc<CommandDispatchTable>,
    replies: Arc<CorrelationChannel>,
    session: OnceLock<Session<T>>,
    state: watch::Sender<ClientState>,
    command_lock: tokio::sync::Mutex<()>,
    devices: Mutex<BTreeMap<String, KnownDevice>>,
    cancel: CancellationToken,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: BusTransport> BusClient<T> {
    /// Create a disconnected client dispatching inbound commands to `listeners`.
    #[must_use]
    pub fn new(listeners: Arc<CommandDispatchTable>, options: BusClientOptions) -> Self {
        let replies = Arc::new(CorrelationChannel::new(options.reply_capacity));
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            options,
            listeners,
            replies,
            session: OnceLock::new(),
            state,
            command_lock: tokio::sync::Mutex::new(()),
            devices: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            loops: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn listeners(&self) -> &Arc<CommandDispatchTable> {
        &self.listeners
    }

    /// The temporary address replies to this client's commands arrive at.
    #[must_use]
    pub fn reply_address(&self) -> Option<&ReplyAddress> {
        self.session.get().map(|session| &session.reply_address)
    }

    /// Connect through `connector`, subscribe to every broadcast and open a
    /// reply address, then start both receive loops. Received events are
    /// stored for `owner` in `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`BusClientError::Connection`] if the transport cannot be set
    /// up; the client is back to `Disconnected` and may be retried.
    /// Returns [`BusClientError::NotConnected`] when the client is not
    /// `Disconnected` to begin with, or when it was closed before the
    /// connection completed; the new transport is closed in that case.
    #[tracing::instrument(skip(self, connector, credentials, sink))]
    pub async fn connect<C, S>(
        &self,
        connector: &C,
        credentials: &Credentials,
        address: &str,
        owner: OwnerId,
        sink: S,
    ) -> Result<(), BusClientError>
    where
        C: BusConnector<Transport = T>,
        S: EventSink + 'static,
    {
        let started = self.state.send_if_modified(|state| {
            if *state == ClientState::Disconnected {
                *state = ClientState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(BusClientError::NotConnected);
        }

        match self.open(connector, credentials, address).await {
            Ok((session, broadcast, replies)) => {
                let outbound = Arc::clone(&session.outbound);
                let reply_address = session.reply_address.clone();
                if self.session.set(session).is_err() {
                    tracing::warn!("bus client session was already set");
                }
                let mut loops = self.loops.lock().await;
                let connected = self.state.send_if_modified(|state| {
                    if *state == ClientState::Connecting {
                        *state = ClientState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if !connected {
                    drop(loops);
                    tracing::info!("bus client closed while connecting");
                    if let Err(error) = outbound.transport.close().await {
                        tracing::debug!(%error, "unable to close abandoned transport");
                    }
                    return Err(BusClientError::NotConnected);
                }

                let event_loop = EventLoop {
                    outbound,
                    reply_address: reply_address.clone(),
                    listeners: Arc::clone(&self.listeners),
                    sink,
                    owner,
                };
                *loops = vec![
                    tokio::spawn(event_loop.run(broadcast, self.cancel.child_token())),
                    tokio::spawn(reply_loop(
                        Arc::clone(&self.replies),
                        replies,
                        self.cancel.child_token(),
                    )),
                ];
                tracing::info!(%reply_address, "connected to bus");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(%error, "unable to connect to bus");
                self.state.send_if_modified(|state| {
                    if *state == ClientState::Connecting {
                        *state = ClientState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                Err(BusClientError::Connection(error))
            }
        }
    }

    async fn open<C>(
        &self,
        connector: &C,
        credentials: &Credentials,
        address: &str,
    ) -> Result<(Session<T>, Inbound, Inbound), TransportError>
    where
        C: BusConnector<Transport = T>,
    {
        let transport = connector.connect(credentials, address).await?;
        let opened = async {
            let broadcast = transport.subscribe(BROADCAST_PATTERN).await?;
            let (reply_address, replies) = transport.create_reply_address().await?;
            Ok::<_, TransportError>((broadcast, reply_address, replies))
        }
        .await;
        match opened {
            Ok((broadcast, reply_address, replies)) => {
                let outbound = Arc::new(Outbound {
                    transport,
                    send_lock: tokio::sync::Mutex::new(()),
                });
                let session = Session {
                    outbound,
                    reply_address,
                };
                Ok((session, broadcast, replies))
            }
            Err(error) => {
                if let Err(close_error) = transport.close().await {
                    tracing::debug!(error = %close_error, "unable to close half-open transport");
                }
                Err(error)
            }
        }
    }

    fn connected(&self) -> Result<&Session<T>, BusClientError> {
        if self.state() != ClientState::Connected {
            return Err(BusClientError::NotConnected);
        }
        self.session.get().ok_or(BusClientError::NotConnected)
    }

    /// Publish an event without waiting for anything in return.
    ///
    /// # Errors
    ///
    /// Returns [`BusClientError::NotConnected`] outside the `Connected`
    /// state, or [`BusClientError::Transport`] if the publish fails.
    pub async fn send_event(&self, message: BusMessage) -> Result<(), BusClientError> {
        let session = self.connected()?;
        session.outbound.publish(message).await?;
        Ok(())
    }

    /// Send a command and wait for its reply.
    ///
    /// At most one command is in flight per client. If several replies come
    /// back within the grace window following the first one, the last one
    /// wins.
    ///
    /// # Errors
    ///
    /// Returns [`BusClientError::CommandTimeout`] when no reply arrives in
    /// time, [`BusClientError::NotConnected`] outside the `Connected` state,
    /// or [`BusClientError::Transport`] if sending fails.
    pub async fn send_command(&self, parameters: Payload) -> Result<Payload, BusClientError> {
        let session = self.connected()?;
        let _in_flight = self.command_lock.lock().await;
        let pending = self.replies.begin(session.reply_address.clone());
        let command = BusMessage::builder()
            .fields(parameters)
            .reply_to(session.reply_address.clone())
            .build();
        tracing::debug!(command = ?command.command_name(), "sending command");
        session.outbound.publish(command).await?;
        match pending
            .wait(self.options.command_timeout, self.options.reply_grace)
            .await
        {
            Some(reply) => Ok(reply.into_payload()),
            None => Err(BusClientError::CommandTimeout(self.options.command_timeout)),
        }
    }

    /// Remember a local device, announce it on the bus and set its name.
    ///
    /// The device is remembered even when the bus cannot be reached, so a
    /// later [`announce_all_devices`](Self::announce_all_devices) picks it up.
    /// Returns `false` if the announcement or the name command fails; the
    /// failure is logged.
    pub async fn add_device(&self, device_id: &str, device_type: &str, name: &str) -> bool {
        let device = KnownDevice {
            device_type: device_type.to_string(),
            name: name.to_string(),
        };
        self.devices().insert(device_id.to_string(), device.clone());
        self.announce(device_id, &device).await
    }

    /// Forget a local device and retract it from the bus.
    ///
    /// Returns `false` if the remove event could not be sent.
    pub async fn remove_device(&self, device_id: &str, device_type: &str) -> bool {
        self.devices().remove(device_id);
        let event = BusMessage::event(SUBJECT_DEVICE_REMOVE)
            .field(DEVICE_ID_KEY, device_id)
            .field(DEVICE_TYPE_KEY, device_type)
            .build();
        match self.send_event(event).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(device_id, %error, "unable to remove device");
                false
            }
        }
    }

    /// Announce and name again every remembered device.
    ///
    /// Returns `true` only if every device was announced and named.
    pub async fn announce_all_devices(&self) -> bool {
        let devices: Vec<(String, KnownDevice)> = self
            .devices()
            .iter()
            .map(|(id, device)| (id.clone(), device.clone()))
            .collect();
        let mut all_sent = true;
        for (device_id, device) in devices {
            all_sent &= self.announce(&device_id, &device).await;
        }
        all_sent
    }

    /// Ids of remembered devices, sorted.
    #[must_use]
    pub fn known_devices(&self) -> Vec<String> {
        self.devices().keys().cloned().collect()
    }

    fn devices(&self) -> MutexGuard<'_, BTreeMap<String, KnownDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn announce(&self, device_id: &str, device: &KnownDevice) -> bool {
        let event = BusMessage::event(SUBJECT_DEVICE_ANNOUNCE)
            .field(DEVICE_ID_KEY, device_id)
            .field(DEVICE_TYPE_KEY, device.device_type.as_str())
            .build();
        if let Err(error) = self.send_event(event).await {
            tracing::warn!(device_id, %error, "unable to announce device");
            return false;
        }
        let rename = BusMessage::command(COMMAND_SET_DEVICE_NAME)
            .field(DEVICE_ID_KEY, device_id)
            .field(NAME_KEY, device.name.as_str())
            .build()
            .into_payload();
        match self.send_command(rename).await {
            Ok(_) => {
                tracing::debug!(device_id, name = %device.name, "announced device");
                true
            }
            Err(error) => {
                tracing::warn!(device_id, %error, "unable to set device name");
                false
            }
        }
    }

    /// Stop both receive loops, wait for them, then close the transport.
    ///
    /// Once this returns no further inbound message is dispatched. Calling
    /// it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BusClientError::Transport`] if the transport fails to close;
    /// the client is `Closed` regardless.
    pub async fn close(&self) -> Result<(), BusClientError> {
        let previous = *self.state.borrow();
        let closing = self.state.send_if_modified(|state| match state {
            ClientState::Closing | ClientState::Closed => false,
            _ => {
                *state = ClientState::Closing;
                true
            }
        });
        if !closing {
            return Ok(());
        }

        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.loops.lock().await);
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "bus client loop ended abnormally");
            }
        }

        let result = match self.session.get() {
            Some(session) if previous == ClientState::Connected => {
                session.outbound.transport.close().await
            }
            _ => Ok(()),
        };
        self.state.send_replace(ClientState::Closed);
        tracing::info!("bus client closed");
        result.map_err(BusClientError::from)
    }
}

impl<T: BusTransport> CommandSender for BusClient<T> {
    fn send_command(
        &self,
        parameters: Payload,
    ) -> impl Future<Output = Result<Payload, BusClientError>> + Send {
        Self::send_command(self, parameters)
    }
}

impl<T> Drop for BusClient<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EventLoop<T, S> {
    outbound: Arc<Outbound<T>>,
    reply_address: ReplyAddress,
    listeners: Arc<CommandDispatchTable>,
    sink: S,
    owner: OwnerId,
}

impl<T: BusTransport, S: EventSink> EventLoop<T, S> {
    async fn run(self, mut inbound: Inbound, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = inbound.recv() => received,
            };
            match received {
                Some(Ok(message)) => self.handle(message).await,
                Some(Err(error)) => tracing::warn!(%error, "failed to receive broadcast message"),
                None => {
                    tracing::warn!("broadcast subscription ended");
                    break;
                }
            }
        }
        tracing::debug!("event loop stopped");
    }

    async fn handle(&self, message: BusMessage) {
        if message.is_event() {
            self.store(&message).await;
        } else if message.reply_to() == Some(&self.reply_address) {
            tracing::trace!("ignoring own command");
        } else {
            self.answer(&message).await;
        }
    }

    async fn store(&self, message: &BusMessage) {
        if message.subject() == Some(SUBJECT_TIME_CHANGED) {
            return;
        }
        let event = match Event::capture(self.owner, message) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, subject = ?message.subject(), "unable to capture event");
                return;
            }
        };
        if let Err(error) = self.sink.save(vec![event]).await {
            tracing::warn!(%error, subject = ?message.subject(), "unable to store event");
        }
    }

    async fn answer(&self, message: &BusMessage) {
        let listeners = Arc::clone(&self.listeners);
        let device_id = message.device_id().map(str::to_owned);
        let command = message.payload().clone();
        let dispatched = match tokio::task::spawn_blocking(move || {
            listeners.dispatch(device_id.as_deref(), &command)
        })
        .await
        {
            Ok(dispatched) => dispatched,
            Err(error) => {
                tracing::warn!(%error, "command dispatch did not complete");
                return;
            }
        };
        let Some(reply_to) = message.reply_to() else {
            return;
        };
        let replies = if dispatched.replies.is_empty() {
            vec![BusMessage::acknowledgement()]
        } else {
            dispatched
                .replies
                .into_iter()
                .map(|reply| BusMessage::builder().fields(reply).build())
                .collect()
        };
        for reply in replies {
            if let Err(error) = self.outbound.send_to(reply_to, reply).await {
                tracing::warn!(%error, %reply_to, "unable to send reply");
            }
        }
    }
}

async fn reply_loop(channel: Arc<CorrelationChannel>, mut inbound: Inbound, cancel: CancellationToken) {
    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = inbound.recv() => received,
        };
        match received {
            Some(Ok(reply)) => channel.offer(reply),
            Some(Err(error)) => tracing::warn!(%error, "failed to receive reply"),
            None => {
                tracing::warn!("reply address closed");
                break;
            }
        }
    }
    tracing::debug!("reply loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CommandListener, ListenerResult, WILDCARD_DEVICE_ID};
    use crate::memory_bus::InMemoryBus;
    use crate::test_support::{RecordingSink, payload};
    use homebus_domain::message::{ACK_KEY, COMMAND_INVENTORY, COMMAND_KEY};
    use serde_json::json;

    const ADDRESS: &str = "memory";

    fn options() -> BusClientOptions {
        BusClientOptions {
            command_timeout: Duration::from_millis(300),
            reply_grace: Duration::from_millis(100),
            reply_capacity: 10,
        }
    }

    async fn connected(
        bus: &InMemoryBus,
        listeners: CommandDispatchTable,
        sink: RecordingSink,
    ) -> BusClient<crate::memory_bus::InMemoryTransport> {
        let client = BusClient::new(Arc::new(listeners), options());
        client
            .connect(bus, &Credentials::default(), ADDRESS, OwnerId::new(), sink)
            .await
            .unwrap();
        client
    }

    fn responder(replies: &'static [&'static str]) -> CommandDispatchTable {
        let table = CommandDispatchTable::new();
        for tag in replies {
            let listener: Arc<dyn CommandListener> = Arc::new(move |_: &Payload| -> ListenerResult {
                Ok(Some(payload(json!({ "from": tag }))))
            });
            table.add(WILDCARD_DEVICE_ID, listener);
        }
        table
    }

    fn command(name: &str) -> Payload {
        payload(json!({ "command": name }))
    }

    #[tokio::test]
    async fn should_walk_through_lifecycle_states() {
        let bus = InMemoryBus::new();
        let client = BusClient::new(Arc::new(CommandDispatchTable::new()), options());
        assert_eq!(client.state(), ClientState::Disconnected);

        client
            .connect(&bus, &Credentials::default(), ADDRESS, OwnerId::new(), RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(client.state(), ClientState::Connected);
        assert!(client.reply_address().is_some());

        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn should_fail_to_connect_when_bus_unreachable() {
        let bus = InMemoryBus::new();
        bus.mark_unreachable(ADDRESS);
        let client: BusClient<crate::memory_bus::InMemoryTransport> =
            BusClient::new(Arc::new(CommandDispatchTable::new()), options());

        let result = client
            .connect(&bus, &Credentials::default(), ADDRESS, OwnerId::new(), RecordingSink::default())
            .await;

        assert!(matches!(result, Err(BusClientError::Connection(_))));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn should_reject_calls_when_not_connected() {
        let client: BusClient<crate::memory_bus::InMemoryTransport> =
            BusClient::new(Arc::new(CommandDispatchTable::new()), options());

        let result = client.send_command(command(COMMAND_INVENTORY)).await;
        assert!(matches!(result, Err(BusClientError::NotConnected)));
        let result = client.send_event(BusMessage::event("event.test").build()).await;
        assert!(matches!(result, Err(BusClientError::NotConnected)));
    }

    #[tokio::test]
    async fn should_return_single_reply() {
        let bus = InMemoryBus::new();
        let _peer = connected(&bus, responder(&["peer"]), RecordingSink::default()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        let reply = client.send_command(command(COMMAND_INVENTORY)).await.unwrap();

        assert_eq!(reply["from"], json!("peer"));
    }

    #[tokio::test]
    async fn should_return_latest_when_two_replies_arrive() {
        let bus = InMemoryBus::new();
        let _peer = connected(&bus, responder(&["first", "second"]), RecordingSink::default()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        let reply = client.send_command(command(COMMAND_INVENTORY)).await.unwrap();

        assert_eq!(reply["from"], json!("second"));
    }

    #[tokio::test]
    async fn should_time_out_when_nobody_answers() {
        let bus = InMemoryBus::new();
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        let result = client.send_command(command(COMMAND_INVENTORY)).await;

        assert!(matches!(result, Err(BusClientError::CommandTimeout(_))));
        assert!(client.replies.is_empty());
    }

    #[tokio::test]
    async fn should_not_return_stale_reply_to_next_command() {
        let bus = InMemoryBus::new();
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;
        let result = client.send_command(command(COMMAND_INVENTORY)).await;
        assert!(matches!(result, Err(BusClientError::CommandTimeout(_))));

        let late = bus.open();
        let reply_to = client.reply_address().unwrap().clone();
        late.send_to(&reply_to, BusMessage::builder().field("from", "late").build())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.replies.len(), 1);

        let _peer = connected(&bus, responder(&["fresh"]), RecordingSink::default()).await;
        let reply = client.send_command(command(COMMAND_INVENTORY)).await.unwrap();
        assert_eq!(reply["from"], json!("fresh"));
    }

    #[tokio::test]
    async fn should_forward_events_to_sink_except_time_changed() {
        let bus = InMemoryBus::new();
        let sink = RecordingSink::default();
        let client = connected(&bus, CommandDispatchTable::new(), sink.clone()).await;
        let remote = bus.open();

        remote
            .publish(BusMessage::event(SUBJECT_TIME_CHANGED).field("minute", 5).build())
            .await
            .unwrap();
        remote
            .publish(
                BusMessage::event("event.environment.temperaturechanged")
                    .field(DEVICE_ID_KEY, "T1")
                    .field("level", 21)
                    .build(),
            )
            .await
            .unwrap();

        let events = sink.wait_for(1, Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.events().len(), 1);
        assert_eq!(
            events[0].subject().as_deref(),
            Some("event.environment.temperaturechanged")
        );
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_acknowledge_command_without_matching_listener() {
        let bus = InMemoryBus::new();
        let calls = Arc::new(Mutex::new(0_usize));
        let counter = Arc::clone(&calls);
        let listeners = CommandDispatchTable::new();
        listeners.add(
            "Y",
            Arc::new(move |_: &Payload| -> ListenerResult {
                *counter.lock().unwrap() += 1;
                Ok(Some(payload(json!({"from": "Y"}))))
            }),
        );
        let _client = connected(&bus, listeners, RecordingSink::default()).await;

        let remote = bus.open();
        let (reply_to, mut replies) = remote.create_reply_address().await.unwrap();
        remote
            .publish(
                BusMessage::command("on")
                    .field(DEVICE_ID_KEY, "X")
                    .reply_to(reply_to)
                    .build(),
            )
            .await
            .unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(1), replies.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(ack.is_acknowledgement());
        assert_eq!(ack.payload().get(ACK_KEY), Some(&json!(true)));
        let extra = tokio::time::timeout(Duration::from_millis(100), replies.recv()).await;
        assert!(extra.is_err());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn should_send_each_listener_reply_to_sender() {
        let bus = InMemoryBus::new();
        let _client = connected(&bus, responder(&["a", "b"]), RecordingSink::default()).await;
        let remote = bus.open();
        let (reply_to, mut replies) = remote.create_reply_address().await.unwrap();

        remote
            .publish(BusMessage::command("status").reply_to(reply_to).build())
            .await
            .unwrap();

        for expected in ["a", "b"] {
            let reply = tokio::time::timeout(Duration::from_secs(1), replies.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(reply.get_str("from"), Some(expected));
        }
    }

    #[tokio::test]
    async fn should_stop_dispatching_after_close() {
        let bus = InMemoryBus::new();
        let sink = RecordingSink::default();
        let client = connected(&bus, CommandDispatchTable::new(), sink.clone()).await;
        client.close().await.unwrap();

        bus.open()
            .publish(BusMessage::event("event.device.stale").build())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn should_close_idempotently_then_reject_calls() {
        let bus = InMemoryBus::new();
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        client.close().await.unwrap();
        client.close().await.unwrap();

        assert_eq!(client.state(), ClientState::Closed);
        let result = client.send_event(BusMessage::event("event.test").build()).await;
        assert!(matches!(result, Err(BusClientError::NotConnected)));
    }

    #[tokio::test]
    async fn should_add_device_when_bus_answers() {
        let bus = InMemoryBus::new();
        let observer_sink = RecordingSink::default();
        let _observer = connected(&bus, CommandDispatchTable::new(), observer_sink.clone()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        assert!(client.add_device("D1", "switch", "Lamp").await);
        assert_eq!(client.known_devices(), vec!["D1".to_string()]);

        let events = observer_sink.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(events[0].subject().as_deref(), Some(SUBJECT_DEVICE_ANNOUNCE));

        assert!(client.announce_all_devices().await);
        assert!(client.remove_device("D1", "switch").await);
        assert!(client.known_devices().is_empty());
    }

    #[tokio::test]
    async fn should_remember_device_even_when_name_is_not_confirmed() {
        let bus = InMemoryBus::new();
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        assert!(!client.add_device("D1", "switch", "Lamp").await);
        assert_eq!(client.known_devices(), vec!["D1".to_string()]);
    }

    #[tokio::test]
    async fn should_announce_devices_added_while_disconnected() {
        let bus = InMemoryBus::new();
        let renamed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&renamed);
        let observer_listeners = CommandDispatchTable::new();
        observer_listeners.add(
            "D1",
            Arc::new(move |command: &Payload| -> ListenerResult {
                if command.get(COMMAND_KEY) == Some(&json!(COMMAND_SET_DEVICE_NAME)) {
                    seen.lock().unwrap().push(command.get(NAME_KEY).cloned());
                }
                Ok(None)
            }),
        );
        let observer_sink = RecordingSink::default();
        let _observer = connected(&bus, observer_listeners, observer_sink.clone()).await;

        let client = BusClient::new(Arc::new(CommandDispatchTable::new()), options());
        assert!(!client.add_device("D1", "switch", "Lamp").await);
        assert_eq!(client.known_devices(), vec!["D1".to_string()]);

        client
            .connect(&bus, &Credentials::default(), ADDRESS, OwnerId::new(), RecordingSink::default())
            .await
            .unwrap();
        assert!(client.announce_all_devices().await);

        let events = observer_sink.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(events[0].subject().as_deref(), Some(SUBJECT_DEVICE_ANNOUNCE));
        assert_eq!(*renamed.lock().unwrap(), vec![Some(json!("Lamp"))]);
    }

    #[tokio::test]
    async fn should_forget_device_even_when_remove_fails() {
        let bus = InMemoryBus::new();
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;
        client.close().await.unwrap();
        assert!(!client.add_device("D1", "switch", "Lamp").await);

        assert!(!client.remove_device("D1", "switch").await);
        assert!(client.known_devices().is_empty());
    }

    #[tokio::test]
    async fn should_return_listener_reply_when_idle_client_acknowledges() {
        let bus = InMemoryBus::new();
        let _idle = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;
        let _peer = connected(&bus, responder(&["peer"]), RecordingSink::default()).await;
        let _late_idle = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        let reply = client.send_command(command(COMMAND_INVENTORY)).await.unwrap();

        assert_eq!(reply["from"], json!("peer"));
    }

    #[tokio::test]
    async fn should_keep_storing_events_after_malformed_broadcast() {
        let bus = InMemoryBus::new();
        let sink = RecordingSink::default();
        let _client = connected(&bus, CommandDispatchTable::new(), sink.clone()).await;

        bus.inject_malformed("event.device.announce");
        bus.open()
            .publish(BusMessage::event("event.device.announce").field(DEVICE_ID_KEY, "D1").build())
            .await
            .unwrap();

        let events = sink.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn should_keep_receiving_replies_after_malformed_reply() {
        let bus = InMemoryBus::new();
        let _peer = connected(&bus, responder(&["peer"]), RecordingSink::default()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        bus.inject_malformed_reply(client.reply_address().unwrap());
        let reply = client.send_command(command(COMMAND_INVENTORY)).await.unwrap();

        assert_eq!(reply["from"], json!("peer"));
    }

    #[tokio::test]
    async fn should_keep_answering_after_listener_panics() {
        let bus = InMemoryBus::new();
        let listeners = CommandDispatchTable::new();
        listeners.add(
            WILDCARD_DEVICE_ID,
            Arc::new(|_: &Payload| -> ListenerResult { panic!("listener bug") }),
        );
        listeners.add(
            WILDCARD_DEVICE_ID,
            Arc::new(|_: &Payload| -> ListenerResult { Ok(Some(payload(json!({"from": "ok"})))) }),
        );
        let sink = RecordingSink::default();
        let _device = connected(&bus, listeners, sink.clone()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        for _ in 0..2 {
            let reply = client.send_command(command("status")).await.unwrap();
            assert_eq!(reply["from"], json!("ok"));
        }
        client
            .send_event(BusMessage::event("event.device.announce").build())
            .await
            .unwrap();
        assert_eq!(sink.wait_for(1, Duration::from_secs(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn should_keep_runtime_responsive_while_listener_blocks() {
        let bus = InMemoryBus::new();
        let listeners = CommandDispatchTable::new();
        listeners.add(
            WILDCARD_DEVICE_ID,
            Arc::new(|_: &Payload| -> ListenerResult {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Some(payload(json!({"from": "slow"}))))
            }),
        );
        let _device = connected(&bus, listeners, RecordingSink::default()).await;
        let client = connected(&bus, CommandDispatchTable::new(), RecordingSink::default()).await;

        let started = tokio::time::Instant::now();
        let (reply, ticked) = tokio::join!(client.send_command(command("status")), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            started.elapsed()
        });

        assert_eq!(reply.unwrap()["from"], json!("slow"));
        assert!(ticked < Duration::from_millis(150), "runtime stalled for {ticked:?}");
    }

    /// Holds every connection attempt until released.
    struct GatedConnector {
        bus: InMemoryBus,
        gate: Arc<tokio::sync::Notify>,
    }

    impl BusConnector for GatedConnector {
        type Transport = crate::memory_bus::InMemoryTransport;

        fn connect(
            &self,
            credentials: &Credentials,
            address: &str,
        ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send {
            let bus = self.bus.clone();
            let gate = Arc::clone(&self.gate);
            let credentials = credentials.clone();
            let address = address.to_string();
            async move {
                gate.notified().await;
                bus.connect(&credentials, &address).await
            }
        }
    }

    #[tokio::test]
    async fn should_stay_closed_when_closed_while_connecting() {
        let bus = InMemoryBus::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let connector = GatedConnector {
            bus: bus.clone(),
            gate: Arc::clone(&gate),
        };
        let client = BusClient::new(Arc::new(CommandDispatchTable::new()), options());
        let credentials = Credentials::default();

        let (connected, closed) = tokio::join!(
            client.connect(
                &connector,
                &credentials,
                ADDRESS,
                OwnerId::new(),
                RecordingSink::default()
            ),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert_eq!(client.state(), ClientState::Connecting);
                let closed = client.close().await;
                gate.notify_one();
                closed
            }
        );

        assert!(matches!(connected, Err(BusClientError::NotConnected)));
        closed.unwrap();
        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(bus.open_endpoints(), 0);
    }
}
