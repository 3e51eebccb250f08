//! Load-then-reconcile synchronization of entity tables.
//!
//! A [`SyncController`] publishes cached rows immediately, fetches the
//! authoritative list from the server, and rewrites its table to match:
//! upsert everything returned, prune what is gone.

mod controller;
mod inflight;
mod query;
mod reconcile;
mod state;

pub use controller::{SyncController, SyncOptions};
pub use inflight::InFlight;
pub use query::Query;
pub use reconcile::PruneScope;
pub use state::{DataSource, QueryState};
