//! # homebus-app
//!
//! Application layer — bus clients, use-cases and **port definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement (driven/outbound ports):
//!   - `BusConnector` / `BusTransport` — reach a message bus
//!   - `ElementRepository` — load and save an owner's element tree
//!   - `BusRepository` — load and save configured buses
//!   - `EventSink` — store events received from a bus
//! - Provide the **bus client**: command/reply correlation, event forwarding
//!   and dispatch of inbound commands to listeners
//! - Provide the **bus client manager** keeping one client per enabled bus
//! - Provide the **inventory synchronizer** use-case
//! - Provide an **in-process bus** that doesn't need IO
//!
//! ## Dependency rule
//! Depends on `homebus-domain` only (plus `tokio` for tasks and channels).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod bus_client;
pub mod bus_manager;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod logging_sink;
pub mod memory_bus;
pub mod ports;
pub mod services;

#[cfg(test)]
mod test_support;
