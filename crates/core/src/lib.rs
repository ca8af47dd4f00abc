//! Core domain for mirroring Salla store data into a relational store.
//!
//! The crate holds the entity mapper, the idempotency rules, the reconciler
//! state machine and the two ingest feeds (webhook push and paginated pull).
//! Storage and the platform API are reached only through the traits declared
//! here; `salla-mirror-storage-sqlite` and `salla-mirror-client` implement them.

pub mod entities;
pub mod errors;
pub mod settings;
pub mod sync;

pub use errors::{DatabaseError, Error, MappingError, Result, WebhookError};
pub use settings::{StoreCredentials, SyncSettings};
