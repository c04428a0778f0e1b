//! # homebusd — homebus controller daemon
//!
//! Composition root that wires storage and the MQTT transport together and
//! runs the bus client manager.
//!
//! ## Responsibilities
//! - Parse configuration (config file, env vars)
//! - Initialise logging
//! - Initialise the `SQLite` connection pool and run migrations
//! - Seed the configured buses into the bus store
//! - Run the bus client manager until Ctrl-C, then close every client
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no domain logic belongs here.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use homebus_adapter_mqtt::MqttConnector;
use homebus_adapter_storage_sqlite_sqlx::{
    Config as StorageConfig, SqliteBusRepository, SqliteElementRepository, SqliteEventSink,
};
use homebus_app::bus_manager::BusClientManager;
use homebus_app::ports::BusRepository;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("unable to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    let owner = config.site.owner;
    tracing::info!(%owner, buses = config.buses.len(), "starting homebusd");

    // Database
    let db = StorageConfig {
        database_url: config.database.url.clone(),
    }
    .build()
    .await
    .context("unable to open database")?;
    let pool = db.pool().clone();

    // Repositories
    let buses = SqliteBusRepository::new(pool.clone());
    let elements = SqliteElementRepository::new(pool.clone());
    let events = Arc::new(SqliteEventSink::new(pool));

    let existing = buses.get_by_owner(owner).await?;
    let seeded = config.seed_buses(&existing)?;
    if !seeded.is_empty() {
        tracing::info!(count = seeded.len(), "seeding configured buses");
        buses.save_buses(seeded).await?;
    }

    // Manager
    let manager = BusClientManager::new(
        MqttConnector::new(config.mqtt.clone()),
        config.credentials(),
        buses,
        elements,
        events,
        config.manager_options(),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
            Err(error) => tracing::error!(%error, "unable to listen for shutdown signal"),
        }
    });

    manager
        .run(cancel)
        .await
        .context("bus client manager failed")?;
    tracing::info!("homebusd stopped");

    Ok(())
}
