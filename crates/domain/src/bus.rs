//! Bus — configuration and live status of one remote bus endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HomeBusError, ValidationError};
use crate::id::{BusId, OwnerId};
use crate::time::{Timestamp, now};

/// Connection status of a [`Bus`], maintained by the client manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusConnectionStatus {
    #[default]
    Disconnected,
    Connected,
    Synchronizing,
    Error,
}

impl BusConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Synchronizing => "synchronizing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BusConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BusConnectionStatus {
    type Err = UnknownConnectionStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connected" => Ok(Self::Connected),
            "synchronizing" => Ok(Self::Synchronizing),
            "error" => Ok(Self::Error),
            other => Err(UnknownConnectionStatus(other.to_string())),
        }
    }
}

/// Returned when parsing an unknown [`BusConnectionStatus`] name.
#[derive(Debug, thiserror::Error)]
#[error("unknown bus connection status {0:?}")]
pub struct UnknownConnectionStatus(pub String);

/// A configured remote bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub owner: OwnerId,
    pub name: String,
    /// Transport address, e.g. `broker.local:1883`.
    pub address: String,
    /// Disabled buses are disconnected by the manager.
    pub enabled: bool,
    pub status: BusConnectionStatus,
    pub last_synchronized: Option<Timestamp>,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl Bus {
    /// Create a builder for constructing a [`Bus`].
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    /// Whether the manager should keep a live client for this bus.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && !self.address.is_empty()
    }

    /// Change the status, bumping `modified`.
    pub fn set_status(&mut self, status: BusConnectionStatus) {
        self.status = status;
        self.modified = now();
    }

    /// Record a successful inventory synchronisation.
    pub fn mark_synchronized(&mut self, at: Timestamp) {
        self.status = BusConnectionStatus::Connected;
        self.last_synchronized = Some(at);
        self.modified = at;
    }

    /// Check domain invariants.
    ///
    /// # Errors
    ///
    /// Returns [`HomeBusError::Validation`] when the name or address is empty.
    pub fn validate(&self) -> Result<(), HomeBusError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyBusName.into());
        }
        if self.address.is_empty() {
            return Err(ValidationError::EmptyBusAddress.into());
        }
        Ok(())
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Step-by-step builder for [`Bus`].
#[derive(Debug)]
pub struct BusBuilder {
    id: Option<BusId>,
    owner: Option<OwnerId>,
    name: Option<String>,
    address: Option<String>,
    enabled: bool,
}

impl Default for BusBuilder {
    fn default() -> Self {
        Self {
            id: None,
            owner: None,
            name: None,
            address: None,
            enabled: true,
        }
    }
}

impl BusBuilder {
    #[must_use]
    pub fn id(mut self, id: BusId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Consume the builder, validate, and return a [`Bus`].
    ///
    /// # Errors
    ///
    /// Returns [`HomeBusError::Validation`] if name or address is missing.
    pub fn build(self) -> Result<Bus, HomeBusError> {
        let created = now();
        let bus = Bus {
            id: self.id.unwrap_or_default(),
            owner: self.owner.unwrap_or_default(),
            name: self.name.unwrap_or_default(),
            address: self.address.unwrap_or_default(),
            enabled: self.enabled,
            status: BusConnectionStatus::Disconnected,
            last_synchronized: None,
            created,
            modified: created,
        };
        bus.validate()?;
        Ok(bus)
    }
}
