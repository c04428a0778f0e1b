//! Local fan-out of incoming publishes to subscription channels.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use homebus_app::error::TransportError;
use homebus_app::ports::Inbound;
use homebus_domain::message::BusMessage;

use crate::topics::topic_matches;

struct Route {
    filter: String,
    sender: mpsc::Sender<Result<BusMessage, TransportError>>,
}

/// Subscription channels keyed by MQTT filter.
pub(crate) struct Routes {
    capacity: usize,
    entries: Mutex<Vec<Route>>,
}

impl Routes {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Route>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, filter: String) -> Inbound {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.entries().push(Route { filter, sender });
        receiver
    }

    /// Distinct filters still in use.
    pub(crate) fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .entries()
            .iter()
            .filter(|route| !route.sender.is_closed())
            .map(|route| route.filter.clone())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// Hand a publish received on `topic` to every matching channel without
    /// waiting; full channels miss it.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) {
        let decoded = BusMessage::from_json(payload).map_err(|err| err.to_string());
        self.entries().retain(|route| {
            if !topic_matches(&route.filter, topic) {
                return true;
            }
            let item = match &decoded {
                Ok(message) => Ok(message.clone()),
                Err(reason) => Err(TransportError::decode(format!("{topic}: {reason}"))),
            };
            match route.sender.try_send(item) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(filter = %route.filter, topic, "subscriber full, dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Drop every channel, ending their streams.
    pub(crate) fn clear(&self) {
        self.entries().clear();
    }
}
