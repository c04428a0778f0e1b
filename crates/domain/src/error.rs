//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`HomeBusError`]
//! when crossing a port boundary.

/// Base error for domain invariants and port boundaries.
#[derive(Debug, thiserror::Error)]
pub enum HomeBusError {
    /// A domain invariant was violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A looked-up record does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// A persistence collaborator failed.
    #[error("storage error")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Domain invariant violations.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// An element was built without an identifier.
    #[error("element id must not be empty")]
    EmptyElementId,

    /// A bus was configured without a name.
    #[error("bus name must not be empty")]
    EmptyBusName,

    /// A bus was configured without an address.
    #[error("bus address must not be empty")]
    EmptyBusAddress,
}

/// A record that was expected to exist but does not.
#[derive(Debug, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    /// Kind of record (e.g. `"Bus"`).
    pub entity: &'static str,
    /// Identifier that was looked up.
    pub id: String,
}
