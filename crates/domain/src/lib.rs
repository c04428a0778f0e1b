//! # homebus-domain
//!
//! Pure domain model for the homebus controller.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions, timestamps
//! - Define **Bus messages** (events and commands exchanged on the shared bus)
//! - Define **Elements** (buildings, rooms and devices of an owner's inventory tree)
//! - Define **Buses** (remote endpoints and their connection status)
//! - Define **Events** (raw bus events captured for later processing)
//! - Reconcile a remote **Inventory** snapshot into the element tree
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod bus;
pub mod element;
pub mod event;
pub mod inventory;
pub mod message;
