//! Hand-written port implementations shared by the unit tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use homebus_domain::bus::Bus;
use homebus_domain::element::Element;
use homebus_domain::error::HomeBusError;
use homebus_domain::event::Event;
use homebus_domain::id::{BusId, ElementId, OwnerId};
use homebus_domain::message::Payload;

use crate::ports::{BusRepository, ElementRepository, EventSink};

pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Event sink keeping everything in memory.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Poll until at least `count` events were saved.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Event> {
        tokio::time::timeout(timeout, async {
            loop {
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("events did not arrive in time")
    }
}

impl EventSink for RecordingSink {
    fn save(&self, events: Vec<Event>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        self.events.lock().unwrap().extend(events);
        async { Ok(()) }
    }
}

#[derive(Default)]
pub struct InMemoryElementRepo {
    store: Mutex<HashMap<(OwnerId, ElementId), Element>>,
    pub fail_saves: Mutex<bool>,
}

impl InMemoryElementRepo {
    pub fn all(&self, owner: OwnerId) -> Vec<Element> {
        let mut elements: Vec<Element> = self
            .store
            .lock()
            .unwrap()
            .values()
            .filter(|element| element.owner == owner)
            .cloned()
            .collect();
        elements.sort_by_key(|element| element.tree_index);
        elements
    }
}

impl ElementRepository for InMemoryElementRepo {
    fn get_elements(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Element>, HomeBusError>> + Send {
        let result = self.all(owner);
        async { Ok(result) }
    }

    fn save_elements(
        &self,
        owner: OwnerId,
        elements: Vec<Element>,
    ) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        let result = if *self.fail_saves.lock().unwrap() {
            Err(HomeBusError::Storage("disk full".into()))
        } else {
            let mut store = self.store.lock().unwrap();
            for element in elements {
                store.insert((owner, element.element_id.clone()), element);
            }
            Ok(())
        };
        async { result }
    }
}

#[derive(Default)]
pub struct InMemoryBusRepo {
    store: Mutex<HashMap<BusId, Bus>>,
}

impl InMemoryBusRepo {
    pub fn with(buses: impl IntoIterator<Item = Bus>) -> Self {
        let repo = Self::default();
        repo.store
            .lock()
            .unwrap()
            .extend(buses.into_iter().map(|bus| (bus.id, bus)));
        repo
    }

    pub fn get(&self, id: BusId) -> Bus {
        self.store.lock().unwrap()[&id].clone()
    }

    pub fn update(&self, id: BusId, change: impl FnOnce(&mut Bus)) {
        let mut store = self.store.lock().unwrap();
        change(store.get_mut(&id).unwrap());
    }
}

impl BusRepository for InMemoryBusRepo {
    fn get_all(&self) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send {
        let mut buses: Vec<Bus> = self.store.lock().unwrap().values().cloned().collect();
        buses.sort_by(|a, b| a.name.cmp(&b.name));
        async { Ok(buses) }
    }

    fn get_by_owner(
        &self,
        owner: OwnerId,
    ) -> impl Future<Output = Result<Vec<Bus>, HomeBusError>> + Send {
        let buses: Vec<Bus> = self
            .store
            .lock()
            .unwrap()
            .values()
            .filter(|bus| bus.owner == owner)
            .cloned()
            .collect();
        async { Ok(buses) }
    }

    fn save_buses(&self, buses: Vec<Bus>) -> impl Future<Output = Result<(), HomeBusError>> + Send {
        self.store
            .lock()
            .unwrap()
            .extend(buses.into_iter().map(|bus| (bus.id, bus)));
        async { Ok(()) }
    }
}
