//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `homebus.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use homebus_adapter_mqtt::MqttConfig;
use homebus_app::bus_client::BusClientOptions;
use homebus_app::bus_manager::ManagerOptions;
use homebus_app::ports::Credentials;
use homebus_domain::bus::Bus;
use homebus_domain::error::HomeBusError;
use homebus_domain::id::OwnerId;
use homebus_domain::time::now;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The owner every configured bus belongs to.
    pub site: SiteConfig,
    /// Bus login.
    pub bus: BusLoginConfig,
    /// Bus client tuning.
    pub client: ClientConfig,
    /// Manager cadence.
    pub manager: ManagerConfig,
    /// MQTT transport settings.
    pub mqtt: MqttConfig,
    /// Database settings.
    pub database: DatabaseConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Buses seeded into the store on startup.
    pub buses: Vec<BusEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub owner: OwnerId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BusLoginConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on waiting for a command reply, in milliseconds.
    pub command_timeout_ms: u64,
    /// How long later replies may replace the first one, in milliseconds.
    pub reply_grace_ms: u64,
    /// Unread replies kept before the oldest is dropped.
    pub reply_capacity: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub reconcile_interval_secs: u64,
    pub inventory_interval_secs: u64,
}

/// `SQLite` database configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `SQLite` connection URL or file path.
    pub url: String,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// One configured bus.
#[derive(Debug, Clone, Deserialize)]
pub struct BusEntry {
    pub name: String,
    /// Broker address, `[mqtt://]host[:port]`.
    pub address: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Config {
    /// Load configuration from `homebus.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// result fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("homebus.toml")?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("HOMEBUS_DATABASE_URL") {
            self.database.url = val;
        }
        if let Some(val) = lookup("HOMEBUS_BUS_USERNAME") {
            self.bus.username = val;
        }
        if let Some(val) = lookup("HOMEBUS_BUS_PASSWORD") {
            self.bus.password = val;
        }
        if let Some(val) = lookup("HOMEBUS_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = lookup("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client.command_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "client.command_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.client.reply_capacity == 0 {
            return Err(ConfigError::Validation(
                "client.reply_capacity must be non-zero".to_string(),
            ));
        }
        if self.manager.reconcile_interval_secs == 0 || self.manager.inventory_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "manager intervals must be non-zero".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for entry in &self.buses {
            if entry.name.is_empty() || entry.address.is_empty() {
                return Err(ConfigError::Validation(
                    "every bus needs a name and an address".to_string(),
                ));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "bus {:?} is configured twice",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Login used for every bus connection.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.bus.username.clone(), self.bus.password.clone())
    }

    #[must_use]
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            reconcile_interval: Duration::from_secs(self.manager.reconcile_interval_secs),
            inventory_interval: Duration::from_secs(self.manager.inventory_interval_secs),
            client: BusClientOptions {
                command_timeout: Duration::from_millis(self.client.command_timeout_ms),
                reply_grace: Duration::from_millis(self.client.reply_grace_ms),
                reply_capacity: self.client.reply_capacity,
            },
        }
    }

    /// Buses to write so the store matches the `[[buses]]` entries.
    ///
    /// Entries are matched to `existing` buses of the site owner by name.
    /// Stored buses without an entry are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`HomeBusError::Validation`] if a new bus is invalid.
    pub fn seed_buses(&self, existing: &[Bus]) -> Result<Vec<Bus>, HomeBusError> {
        let mut changed = Vec::new();
        for entry in &self.buses {
            let known = existing
                .iter()
                .find(|bus| bus.owner == self.site.owner && bus.name == entry.name);
            match known {
                Some(bus) if bus.address == entry.address && bus.enabled == entry.enabled => {}
                Some(bus) => {
                    let mut bus = bus.clone();
                    bus.address.clone_from(&entry.address);
                    bus.enabled = entry.enabled;
                    bus.modified = now();
                    changed.push(bus);
                }
                None => changed.push(
                    Bus::builder()
                        .owner(self.site.owner)
                        .name(entry.name.clone())
                        .address(entry.address.clone())
                        .enabled(entry.enabled)
                        .build()?,
                ),
            }
        }
        Ok(changed)
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            owner: OwnerId::from_uuid(uuid::Uuid::nil()),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            reply_grace_ms: 500,
            reply_capacity: 10,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 30,
            inventory_interval_secs: 300,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:homebus.db?mode=rwc".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "homebusd=info,homebus=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
