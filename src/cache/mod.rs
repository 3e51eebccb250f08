//! Durable local cache for remote entities.
//!
//! This module provides:
//! - One SQLite table per entity kind, keyed by the entity's numeric id
//! - An additive, versioned schema
//! - Atomic multi-row writes through scoped transactions
//! - A lazily opened handle shared by every sync controller

mod handle;
mod schema;
mod storage;
mod traits;

pub use handle::StoreHandle;
pub use storage::{Store, StoreTx};
pub use traits::{CachedRecord, Entity, EntityKind};
