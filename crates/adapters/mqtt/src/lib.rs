//! # homebus-adapter-mqtt
//!
//! MQTT adapter — carries bus messages over an MQTT broker.
//!
//! ## Responsibilities
//! - Implement the `BusConnector` / `BusTransport` ports from `homebus-app`
//! - Map bus subjects and patterns onto MQTT topics and filters
//! - Drive the `rumqttc` event loop and route incoming publishes to
//!   subscription channels
//! - Provide temporary reply topics for command/reply exchanges
//!
//! ## Dependency rule
//! Same as other adapters: depends on `homebus-app` and `homebus-domain`.

pub mod config;
pub mod error;
pub mod topics;
pub mod transport;

mod routes;

pub use config::MqttConfig;
pub use error::MqttError;
pub use transport::{MqttConnector, MqttTransport};
