//! Command dispatch table — routes inbound commands to per-device listeners.
//!
//! A table is owned by one bus client and passed in at construction; there
//! is no process-wide registry.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use homebus_domain::message::Payload;

use crate::error::ListenerError;

/// Device id matching every inbound command regardless of target.
pub const WILDCARD_DEVICE_ID: &str = "*";

/// Result of handling one command.
pub type ListenerResult = Result<Option<Payload>, ListenerError>;

/// Receives commands addressed to a device.
///
/// Returning `Ok(None)` or an empty payload means "stay silent"; any other
/// payload is sent back to the command's reply address.
///
/// The bus client runs listeners on the blocking thread pool, so a listener
/// may wait on I/O or a child process without stalling the runtime.
pub trait CommandListener: Send + Sync {
    /// Handle one command payload.
    ///
    /// # Errors
    ///
    /// A [`ListenerError`] is logged by the dispatcher and does not stop the
    /// remaining listeners.
    fn command_received(&self, command: &Payload) -> ListenerResult;
}

impl<F> CommandListener for F
where
    F: Fn(&Payload) -> ListenerResult + Send + Sync,
{
    fn command_received(&self, command: &Payload) -> ListenerResult {
        self(command)
    }
}

/// Outcome of dispatching one command.
#[derive(Debug, Default)]
pub struct Dispatched {
    /// Non-empty replies in listener order.
    pub replies: Vec<Payload>,
    /// How many listeners ran.
    pub invoked: usize,
    /// How many listeners failed or panicked.
    pub failed: usize,
}

/// Device id → ordered listeners.
#[derive(Default)]
pub struct CommandDispatchTable {
    listeners: RwLock<HashMap<String, Vec<Arc<dyn CommandListener>>>>,
}

impl CommandDispatchTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `device_id` (or [`WILDCARD_DEVICE_ID`]).
    ///
    /// Registering the same listener twice makes it run twice.
    pub fn add(&self, device_id: impl Into<String>, listener: Arc<dyn CommandListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(device_id.into())
            .or_default()
            .push(listener);
    }

    /// Unregister one registration of `listener` for `device_id`.
    ///
    /// Returns `false` when it was not registered.
    pub fn remove(&self, device_id: &str, listener: &Arc<dyn CommandListener>) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = listeners.get_mut(device_id) else {
            return false;
        };
        let Some(position) = registered
            .iter()
            .position(|candidate| std::ptr::addr_eq(Arc::as_ptr(candidate), Arc::as_ptr(listener)))
        else {
            return false;
        };
        registered.remove(position);
        if registered.is_empty() {
            listeners.remove(device_id);
        }
        true
    }

    /// Number of listeners registered for exactly `device_id`.
    #[must_use]
    pub fn count(&self, device_id: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .map_or(0, Vec::len)
    }

    fn matching(&self, device_id: Option<&str>) -> Vec<Arc<dyn CommandListener>> {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let targeted = device_id
            .filter(|id| *id != WILDCARD_DEVICE_ID)
            .and_then(|id| listeners.get(id));
        targeted
            .into_iter()
            .chain(listeners.get(WILDCARD_DEVICE_ID))
            .flatten()
            .cloned()
            .collect()
    }

    /// Run every listener matching `device_id`: the device's own listeners
    /// first, then the wildcard ones, each in registration order.
    pub fn dispatch(&self, device_id: Option<&str>, command: &Payload) -> Dispatched {
        let mut outcome = Dispatched::default();
        for listener in self.matching(device_id) {
            outcome.invoked += 1;
            let result = catch_unwind(AssertUnwindSafe(|| listener.command_received(command)))
                .unwrap_or_else(|panic| Err(ListenerError::Panicked(panic_message(&*panic))));
            match result {
                Ok(Some(reply)) if !reply.is_empty() => outcome.replies.push(reply),
                Ok(_) => {}
                Err(error) => {
                    outcome.failed += 1;
                    tracing::warn!(device_id = ?device_id, %error, "command listener failed");
                }
            }
        }
        outcome
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
