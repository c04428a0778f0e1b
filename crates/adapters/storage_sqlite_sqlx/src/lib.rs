//! # homebus-adapter-storage-sqlite-sqlx
//!
//! `SQLite` persistence adapter using [sqlx](https://docs.rs/sqlx).
//!
//! ## Responsibilities
//! - Implement the storage port traits defined in `homebus-app::ports`:
//!   `ElementRepository`, `BusRepository` and `EventSink`
//! - Manage `SQLite` connection pool lifecycle
//! - Run database migrations (using sqlx embedded migrations)
//! - Map between domain types and database rows
//!
//! ## Dependency rule
//! Depends on `homebus-app` (for port traits) and `homebus-domain` (for domain types).
//! The `app` and `domain` crates must never reference this adapter.

pub mod bus_repo;
pub mod element_repo;
pub mod error;
pub mod event_sink;
pub mod pool;

mod decode;

pub use bus_repo::SqliteBusRepository;
pub use element_repo::SqliteElementRepository;
pub use event_sink::SqliteEventSink;
pub use pool::{Config, Database};
