//! The device registry: devices, their property cache, aliases, groups,
//! and atomic JSON persistence.
//!
//! Grounded on the shape of a typed store with its own error enum and
//! an open-time integrity check, adapted from a SQL-backed store to
//! three flat JSON files per the persisted-state design this system
//! actually calls for.

mod error;
mod model;
mod persistence;
mod store;

pub use error::RegistryError;
pub use model::{AccessRules, Descriptor, Device, PropertyValue, UpsertOutcome, DEFAULT_PROPERTY_TTL};
pub use store::{DeviceFilter, Registry};
