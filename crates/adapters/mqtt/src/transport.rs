//! MQTT implementation of the bus transport ports.
//!
//! One [`MqttTransport`] owns one broker connection. A background task polls
//! the `rumqttc` event loop, re-subscribes after the client reconnects and
//! fans incoming publishes out to the subscription channels.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use homebus_app::error::TransportError;
use homebus_app::ports::{BusConnector, BusTransport, Credentials, Inbound};
use homebus_domain::message::{BusMessage, ReplyAddress};

use crate::config::MqttConfig;
use crate::error::MqttError;
use crate::routes::Routes;
use crate::topics::{TopicMap, parse_address};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Opens [`MqttTransport`]s to the broker named by each bus address.
#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    config: MqttConfig,
}

impl MqttConnector {
    #[must_use]
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

impl BusConnector for MqttConnector {
    type Transport = MqttTransport;

    fn connect(
        &self,
        credentials: &Credentials,
        address: &str,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send {
        let config = self.config.clone();
        let credentials = credentials.clone();
        let address = address.to_string();
        async move {
            MqttTransport::connect(&config, &credentials, &address)
                .await
                .map_err(|err| err.into_transport(&address))
        }
    }
}

/// One connection to an MQTT broker.
pub struct MqttTransport {
    client: AsyncClient,
    client_id: String,
    topics: TopicMap,
    routes: Arc<Routes>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MqttTransport {
    /// Connect to the broker at `address` and wait for it to accept the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::InvalidAddress`] for a malformed address,
    /// [`MqttError::Connection`] if the broker refuses or cannot be reached,
    /// or [`MqttError::ConnectTimeout`] if it does not answer in time.
    #[tracing::instrument(skip(config, credentials))]
    pub async fn connect(
        config: &MqttConfig,
        credentials: &Credentials,
        address: &str,
    ) -> Result<Self, MqttError> {
        let (host, port) =
            parse_address(address).ok_or_else(|| MqttError::InvalidAddress(address.to_string()))?;
        let client_id = format!("{}-{}", config.client_id_prefix, uuid::Uuid::new_v4().simple());

        let mut options = MqttOptions::new(client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        if !credentials.is_anonymous() {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, config.channel_capacity.max(1));
        tokio::time::timeout(config.connect_timeout(), wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| MqttError::ConnectTimeout(config.connect_timeout()))??;
        tracing::info!(%client_id, "connected to MQTT broker");

        let routes = Arc::new(Routes::new(config.channel_capacity));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(route_incoming(
            eventloop,
            client.clone(),
            Arc::clone(&routes),
            cancel.child_token(),
        ));

        Ok(Self {
            client,
            client_id,
            topics: TopicMap::new(config.base_topic.clone()),
            routes,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, topic: String, message: BusMessage) -> Result<(), TransportError> {
        self.ensure_open()?;
        let payload = message.to_json().map_err(TransportError::send)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| TransportError::send(MqttError::Client(err)))
    }

    async fn listen(&self, filter: String) -> Result<Inbound, TransportError> {
        self.ensure_open()?;
        let receiver = self.routes.add(filter.clone());
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|err| TransportError::send(MqttError::Client(err)))?;
        Ok(receiver)
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(mut task) = self.task.lock().await.take() else {
            return;
        };
        if let Err(error) = self.client.disconnect().await {
            tracing::debug!(%error, "unable to request MQTT disconnect");
            self.cancel.cancel();
        }
        let finished = match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
            Ok(finished) => finished,
            Err(_) => {
                self.cancel.cancel();
                task.await
            }
        };
        if let Err(error) = finished {
            tracing::warn!(%error, "MQTT routing task ended abnormally");
        }
        self.routes.clear();
        tracing::info!(client_id = %self.client_id, "disconnected from MQTT broker");
    }
}

impl BusTransport for MqttTransport {
    fn publish(
        &self,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let topic = self.topics.broadcast_topic(&message);
        self.send(topic, message)
    }

    fn send_to(
        &self,
        address: &ReplyAddress,
        message: BusMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.send(address.as_str().to_string(), message)
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Inbound, TransportError>> + Send {
        let filter = self.topics.broadcast_filter(pattern);
        self.listen(filter)
    }

    fn create_reply_address(
        &self,
    ) -> impl Future<Output = Result<(ReplyAddress, Inbound), TransportError>> + Send {
        let topic = self.topics.reply_topic(&self.client_id);
        async move {
            let receiver = self.listen(topic.clone()).await?;
            Ok((ReplyAddress::new(topic), receiver))
        }
    }

    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            self.shutdown().await;
            Ok(())
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(error) => return Err(MqttError::Connection(error)),
        }
    }
}

async fn route_incoming(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: Arc<Routes>,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(publish.topic.as_ref()).into_owned();
                routes.deliver(&topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("reconnected to MQTT broker, restoring subscriptions");
                restore_subscriptions(&client, &routes);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%error, "MQTT connection error, retrying");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    routes.clear();
    tracing::debug!("MQTT routing task stopped");
}

/// Queue a subscribe request for every routed filter.
///
/// Runs on the task that drains the request queue, so it must not wait for
/// room in it: a filter that does not fit is logged and skipped.
fn restore_subscriptions(client: &AsyncClient, routes: &Routes) -> usize {
    let mut queued = 0;
    for filter in routes.filters() {
        match client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
            Ok(()) => queued += 1,
            Err(error) => tracing::warn!(%filter, %error, "unable to restore subscription"),
        }
    }
    queued
}
