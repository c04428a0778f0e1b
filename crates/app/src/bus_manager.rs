//! Bus client manager — keeps one live [`BusClient`] per enabled bus.
//!
//! Every reconcile tick performs a full diff between the configured buses and
//! the live clients: missing clients are connected, clients of removed or
//! disabled buses are closed. On its own, slower cadence the manager pulls
//! each connected bus's inventory into the element tree.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use homebus_domain::bus::{Bus, BusConnectionStatus};
use homebus_domain::error::HomeBusError;
use homebus_domain::id::{BusId, OwnerId};
use homebus_domain::time::now;

use crate::bus_client::{BusClient, BusClientOptions};
use crate::dispatch::CommandDispatchTable;
use crate::error::BusClientError;
use crate::ports::{BusConnector, BusRepository, BusTransport, Credentials, ElementRepository, EventSink};
use crate::services::InventorySynchronizer;

/// Cadence and client settings of a [`BusClientManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How often configured buses are compared with live clients.
    pub reconcile_interval: Duration,
    /// How often inventories are pulled from connected buses.
    pub inventory_interval: Duration,
    /// Settings for every client the manager opens.
    pub client: BusClientOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            inventory_interval: Duration::from_secs(300),
            client: BusClientOptions::default(),
        }
    }
}

struct ManagedClient<T> {
    name: String,
    address: String,
    client: Arc<BusClient<T>>,
}

impl<T: BusTransport> ManagedClient<T> {
    async fn close(&self) {
        match self.client.close().await {
            Ok(()) => tracing::info!(bus = %self.name, "bus client closed"),
            Err(error) => tracing::warn!(bus = %self.name, %error, "unable to close bus client"),
        }
    }
}

/// Owns the live bus clients and keeps bus statuses up to date.
pub struct BusClientManager<C: BusConnector, BR, ER, S> {
    connector: C,
    credentials: Credentials,
    buses: BR,
    synchronizer: InventorySynchronizer<ER>,
    sink: S,
    options: ManagerOptions,
    clients: tokio::sync::Mutex<HashMap<BusId, ManagedClient<C::Transport>>>,
}

impl<C, BR, ER, S> BusClientManager<C, BR, ER, S>
where
    C: BusConnector,
    BR: BusRepository,
    ER: ElementRepository,
    S: EventSink + Clone + 'static,
{
    /// Create a manager with no live clients.
    pub fn new(
        connector: C,
        credentials: Credentials,
        buses: BR,
        elements: ER,
        sink: S,
        options: ManagerOptions,
    ) -> Self {
        Self {
            connector,
            credentials,
            buses,
            synchronizer: InventorySynchronizer::new(elements),
            sink,
            options,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Live client of `bus`, if any.
    pub async fn client(&self, bus: BusId) -> Option<Arc<BusClient<C::Transport>>> {
        self.clients
            .lock()
            .await
            .get(&bus)
            .map(|managed| Arc::clone(&managed.client))
    }

    /// Bring live clients in line with the configured buses.
    ///
    /// # Errors
    ///
    /// Returns a storage error if buses cannot be loaded or saved. Connection
    /// failures are not errors; they set the bus status to `Error`.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), HomeBusError> {
        let buses = self.buses.get_all().await?;
        let mut clients = self.clients.lock().await;

        let stale: Vec<BusId> = clients
            .iter()
            .filter(|(id, managed)| {
                !buses.iter().any(|bus| {
                    bus.id == **id && bus.is_active() && bus.address == managed.address
                })
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(managed) = clients.remove(&id) {
                managed.close().await;
            }
        }

        let mut changed = Vec::new();
        for mut bus in buses {
            if !bus.is_active() {
                if bus.status != BusConnectionStatus::Disconnected {
                    bus.set_status(BusConnectionStatus::Disconnected);
                    changed.push(bus);
                }
                continue;
            }
            if clients.contains_key(&bus.id) {
                continue;
            }
            match self.open_client(&bus).await {
                Ok(client) => {
                    tracing::info!(bus = %bus.name, address = %bus.address, "bus client connected");
                    clients.insert(
                        bus.id,
                        ManagedClient {
                            name: bus.name.clone(),
                            address: bus.address.clone(),
                            client,
                        },
                    );
                    bus.set_status(BusConnectionStatus::Connected);
                }
                Err(error) => {
                    tracing::warn!(bus = %bus.name, address = %bus.address, %error, "bus client connection failed");
                    bus.set_status(BusConnectionStatus::Error);
                }
            }
            changed.push(bus);
        }
        drop(clients);

        if !changed.is_empty() {
            self.buses.save_buses(changed).await?;
        }
        Ok(())
    }

    async fn open_client(&self, bus: &Bus) -> Result<Arc<BusClient<C::Transport>>, BusClientError> {
        let client = BusClient::new(
            Arc::new(CommandDispatchTable::new()),
            self.options.client.clone(),
        );
        client
            .connect(
                &self.connector,
                &self.credentials,
                &bus.address,
                bus.owner,
                self.sink.clone(),
            )
            .await?;
        Ok(Arc::new(client))
    }

    /// Pull the inventory of every connected bus now.
    ///
    /// Buses of one owner are synchronised back to back, in name order, each
    /// one starting its tree indices where the previous one stopped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if bus statuses cannot be loaded or saved. A
    /// failed synchronisation only sets that bus's status to `Error`.
    #[tracing::instrument(skip(self))]
    pub async fn synchronize_now(&self) -> Result<(), HomeBusError> {
        let live: HashMap<BusId, Arc<BusClient<C::Transport>>> = self
            .clients
            .lock()
            .await
            .iter()
            .map(|(id, managed)| (*id, Arc::clone(&managed.client)))
            .collect();

        let mut by_owner: BTreeMap<OwnerId, Vec<(Bus, Arc<BusClient<C::Transport>>)>> =
            BTreeMap::new();
        for bus in self.buses.get_all().await? {
            if let Some(client) = live.get(&bus.id) {
                by_owner
                    .entry(bus.owner)
                    .or_default()
                    .push((bus, Arc::clone(client)));
            }
        }

        for (owner, mut buses) in by_owner {
            buses.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            let mut offset = 0;
            for (mut bus, client) in buses {
                bus.set_status(BusConnectionStatus::Synchronizing);
                self.buses.save_buses(vec![bus.clone()]).await?;
                match self.synchronizer.synchronize(owner, client.as_ref(), offset).await {
                    Ok(next) => {
                        offset = next;
                        bus.mark_synchronized(now());
                    }
                    Err(error) => {
                        tracing::warn!(bus = %bus.name, %error, "inventory synchronisation failed");
                        bus.set_status(BusConnectionStatus::Error);
                    }
                }
                self.buses.save_buses(vec![bus]).await?;
            }
        }
        Ok(())
    }

    /// Close every live client and mark every bus `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if bus statuses cannot be loaded or saved.
    pub async fn shutdown(&self) -> Result<(), HomeBusError> {
        let clients: Vec<ManagedClient<C::Transport>> =
            self.clients.lock().await.drain().map(|(_, managed)| managed).collect();
        for managed in &clients {
            managed.close().await;
        }

        let disconnected: Vec<Bus> = self
            .buses
            .get_all()
            .await?
            .into_iter()
            .filter(|bus| bus.status != BusConnectionStatus::Disconnected)
            .map(|mut bus| {
                bus.set_status(BusConnectionStatus::Disconnected);
                bus
            })
            .collect();
        if !disconnected.is_empty() {
            self.buses.save_buses(disconnected).await?;
        }
        Ok(())
    }

    /// Reconcile and synchronise on their intervals until `cancel` fires,
    /// then shut down.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the final [`shutdown`](Self::shutdown).
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), HomeBusError> {
        let mut reconcile = tokio::time::interval(self.options.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inventory = tokio::time::interval(self.options.inventory_interval);
        inventory.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("bus client manager started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = reconcile.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::warn!(%error, "bus reconciliation failed");
                    }
                }
                _ = inventory.tick() => {
                    if let Err(error) = self.synchronize_now().await {
                        tracing::warn!(%error, "inventory pass failed");
                    }
                }
            }
        }
        tracing::info!("bus client manager stopping");
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_client::ClientState;
    use crate::dispatch::{CommandListener, ListenerResult, WILDCARD_DEVICE_ID};
    use crate::memory_bus::{InMemoryBus, InMemoryTransport};
    use crate::test_support::{InMemoryBusRepo, InMemoryElementRepo, RecordingSink, payload};
    use homebus_domain::message::{COMMAND_INVENTORY, Payload};
    use serde_json::json;

    type TestManager =
        BusClientManager<InMemoryBus, Arc<InMemoryBusRepo>, Arc<InMemoryElementRepo>, RecordingSink>;

    struct Fixture {
        bus: InMemoryBus,
        buses: Arc<InMemoryBusRepo>,
        elements: Arc<InMemoryElementRepo>,
        manager: TestManager,
        owner: OwnerId,
    }

    fn options() -> ManagerOptions {
        ManagerOptions {
            reconcile_interval: Duration::from_secs(30),
            inventory_interval: Duration::from_secs(300),
            client: BusClientOptions {
                command_timeout: Duration::from_millis(200),
                reply_grace: Duration::from_millis(30),
                reply_capacity: 10,
            },
        }
    }

    fn fixture(configured: Vec<(&str, &str)>) -> (Fixture, Vec<BusId>) {
        let owner = OwnerId::new();
        let configured: Vec<Bus> = configured
            .into_iter()
            .map(|(name, address)| {
                Bus::builder()
                    .owner(owner)
                    .name(name)
                    .address(address)
                    .build()
                    .unwrap()
            })
            .collect();
        let ids = configured.iter().map(|bus| bus.id).collect();
        let bus = InMemoryBus::new();
        let buses = Arc::new(InMemoryBusRepo::with(configured));
        let elements = Arc::new(InMemoryElementRepo::default());
        let manager = BusClientManager::new(
            bus.clone(),
            Credentials::default(),
            Arc::clone(&buses),
            Arc::clone(&elements),
            RecordingSink::default(),
            options(),
        );
        (
            Fixture {
                bus,
                buses,
                elements,
                manager,
                owner,
            },
            ids,
        )
    }

    /// A device-side client answering the inventory command.
    async fn inventory_responder(bus: &InMemoryBus) -> BusClient<InMemoryTransport> {
        let listeners = CommandDispatchTable::new();
        let listener: Arc<dyn CommandListener> = Arc::new(|command: &Payload| -> ListenerResult {
            if command.get("command") != Some(&json!(COMMAND_INVENTORY)) {
                return Ok(None);
            }
            Ok(Some(payload(json!({
                "rooms": {"R1": {"name": "Kitchen", "location": ""}},
                "inventory": {"D1": {"name": "Lamp", "room": "R1", "devicetype": "light"}}
            }))))
        });
        listeners.add(WILDCARD_DEVICE_ID, listener);
        let client = BusClient::new(Arc::new(listeners), options().client);
        client
            .connect(bus, &Credentials::default(), "device", OwnerId::new(), RecordingSink::default())
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn should_connect_enabled_bus_and_mark_connected() {
        let (f, ids) = fixture(vec![("home", "memory")]);

        f.manager.tick().await.unwrap();

        assert_eq!(f.buses.get(ids[0]).status, BusConnectionStatus::Connected);
        let client = f.manager.client(ids[0]).await.unwrap();
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn should_mark_error_when_connection_fails() {
        let (f, ids) = fixture(vec![("home", "memory"), ("cottage", "down")]);
        f.bus.mark_unreachable("down");

        f.manager.tick().await.unwrap();

        assert_eq!(f.buses.get(ids[0]).status, BusConnectionStatus::Connected);
        assert_eq!(f.buses.get(ids[1]).status, BusConnectionStatus::Error);
        assert!(f.manager.client(ids[1]).await.is_none());
    }

    #[tokio::test]
    async fn should_retry_failed_connection_on_next_tick() {
        let (f, ids) = fixture(vec![("cottage", "down")]);
        f.bus.mark_unreachable("down");
        f.manager.tick().await.unwrap();
        assert_eq!(f.buses.get(ids[0]).status, BusConnectionStatus::Error);

        f.bus.mark_reachable("down");
        f.manager.tick().await.unwrap();

        assert_eq!(f.buses.get(ids[0]).status, BusConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn should_close_client_when_bus_disabled() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        f.manager.tick().await.unwrap();
        let client = f.manager.client(ids[0]).await.unwrap();

        f.buses.update(ids[0], |bus| bus.enabled = false);
        f.manager.tick().await.unwrap();

        assert_eq!(client.state(), ClientState::Closed);
        assert!(f.manager.client(ids[0]).await.is_none());
        assert_eq!(f.buses.get(ids[0]).status, BusConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn should_reconnect_when_address_changes() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        f.manager.tick().await.unwrap();
        let before = f.manager.client(ids[0]).await.unwrap();

        f.buses.update(ids[0], |bus| bus.address = "memory-2".to_string());
        f.manager.tick().await.unwrap();

        let after = f.manager.client(ids[0]).await.unwrap();
        assert_eq!(before.state(), ClientState::Closed);
        assert_eq!(after.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn should_synchronize_inventory_and_record_time() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        let _device = inventory_responder(&f.bus).await;
        f.manager.tick().await.unwrap();

        f.manager.synchronize_now().await.unwrap();

        let bus = f.buses.get(ids[0]);
        assert_eq!(bus.status, BusConnectionStatus::Connected);
        assert!(bus.last_synchronized.is_some());
        let names: Vec<String> = f.elements.all(f.owner).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["", "Kitchen", "Lamp"]);
    }

    #[tokio::test]
    async fn should_mark_error_when_inventory_times_out() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        f.manager.tick().await.unwrap();

        f.manager.synchronize_now().await.unwrap();

        let bus = f.buses.get(ids[0]);
        assert_eq!(bus.status, BusConnectionStatus::Error);
        assert!(bus.last_synchronized.is_none());
        assert!(f.elements.all(f.owner).is_empty());
    }

    /// A client with no listeners; it acknowledges every command it sees.
    async fn idle_agent(bus: &InMemoryBus) -> BusClient<InMemoryTransport> {
        let client = BusClient::new(Arc::new(CommandDispatchTable::new()), options().client);
        client
            .connect(bus, &Credentials::default(), "agent", OwnerId::new(), RecordingSink::default())
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn should_keep_inventory_when_other_clients_acknowledge() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        let _idle = idle_agent(&f.bus).await;
        let _device = inventory_responder(&f.bus).await;
        let _late_idle = idle_agent(&f.bus).await;
        f.manager.tick().await.unwrap();

        f.manager.synchronize_now().await.unwrap();

        let bus = f.buses.get(ids[0]);
        assert_eq!(bus.status, BusConnectionStatus::Connected);
        let names: Vec<String> = f.elements.all(f.owner).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["", "Kitchen", "Lamp"]);
    }

    #[tokio::test]
    async fn should_mark_error_when_only_acknowledgements_answer_inventory() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        let _idle = idle_agent(&f.bus).await;
        f.manager.tick().await.unwrap();

        f.manager.synchronize_now().await.unwrap();

        let bus = f.buses.get(ids[0]);
        assert_eq!(bus.status, BusConnectionStatus::Error);
        assert!(bus.last_synchronized.is_none());
        assert!(f.elements.all(f.owner).is_empty());
    }

    #[tokio::test]
    async fn should_close_everything_on_shutdown() {
        let (f, ids) = fixture(vec![("home", "memory"), ("cottage", "down")]);
        f.bus.mark_unreachable("down");
        f.manager.tick().await.unwrap();
        let client = f.manager.client(ids[0]).await.unwrap();

        f.manager.shutdown().await.unwrap();

        assert_eq!(client.state(), ClientState::Closed);
        for id in ids {
            assert_eq!(f.buses.get(id).status, BusConnectionStatus::Disconnected);
        }
    }

    #[tokio::test]
    async fn should_run_until_cancelled() {
        let (f, ids) = fixture(vec![("home", "memory")]);
        let _device = inventory_responder(&f.bus).await;
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        let (result, ()) = tokio::join!(f.manager.run(cancel), async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stop.cancel();
        });

        result.unwrap();
        let bus = f.buses.get(ids[0]);
        assert!(bus.last_synchronized.is_some());
        assert_eq!(bus.status, BusConnectionStatus::Disconnected);
        assert_eq!(f.elements.all(f.owner).len(), 3);
    }
}
