//! Inventory synchronizer — pulls a bus's room/device listing into the
//! owner's element tree.

use homebus_domain::id::OwnerId;
use homebus_domain::inventory::{InventorySnapshot, reconcile};
use homebus_domain::message::{COMMAND_INVENTORY, COMMAND_KEY, Payload};

use crate::bus_client::CommandSender;
use crate::error::SyncError;
use crate::ports::ElementRepository;

/// Application service reconciling remote inventories into the element store.
pub struct InventorySynchronizer<R> {
    repo: R,
}

impl<R: ElementRepository> InventorySynchronizer<R> {
    /// Create a new synchronizer backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Ask `bus` for its inventory and merge it into `owner`'s tree, numbering
    /// elements from `start_index + 1`.
    ///
    /// Returns the last index used, to be passed as `start_index` when the
    /// next bus of the same owner is synchronised.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Command`] if the command fails or times out,
    /// [`SyncError::Snapshot`] if the reply is not an inventory (a bare
    /// acknowledgement included), or
    /// [`SyncError::Storage`] if the store fails. Nothing is written unless
    /// every step before saving succeeded.
    #[tracing::instrument(skip(self, bus))]
    pub async fn synchronize<B: CommandSender>(
        &self,
        owner: OwnerId,
        bus: &B,
        start_index: u32,
    ) -> Result<u32, SyncError> {
        let mut command = Payload::new();
        command.insert(COMMAND_KEY.to_string(), COMMAND_INVENTORY.into());
        let reply = bus.send_command(command).await?;
        let snapshot = InventorySnapshot::from_payload(&reply)?;
        if snapshot.is_empty() {
            tracing::debug!("inventory reply lists no rooms or devices");
        }

        let existing = self.repo.get_elements(owner).await?;
        let reconciled = reconcile(owner, existing, &snapshot, start_index);
        tracing::info!(
            elements = reconciled.elements.len(),
            next_index = reconciled.next_index,
            "inventory synchronised"
        );
        self.repo.save_elements(owner, reconciled.elements).await?;
        Ok(reconciled.next_index)
    }
}
