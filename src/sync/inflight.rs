//! Collapse overlapping syncs of the same query into one.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Raw entities returned by a completed fetch + reconciliation.
pub type SyncOutcome = Result<Arc<Vec<Value>>, String>;

struct Slot {
  generation: u64,
  started: Instant,
  work: Shared<BoxFuture<'static, SyncOutcome>>,
}

/// Single-slot registry keyed by `kind/fingerprint`.
///
/// The first caller for a key starts the work; callers arriving while it runs
/// await the same future instead of starting their own. A caller passing
/// `not_before` never joins work started before that instant: it starts new
/// work and takes over the slot.
#[derive(Clone, Default)]
pub struct InFlight {
  slots: Arc<Mutex<HashMap<String, Slot>>>,
  generation: Arc<AtomicU64>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn run<F>(&self, key: String, not_before: Option<Instant>, start: F) -> SyncOutcome
  where
    F: FnOnce() -> BoxFuture<'static, SyncOutcome>,
  {
    let (generation, work) = {
      let mut slots = self
        .slots
        .lock()
        .map_err(|e| format!("Lock poisoned: {}", e))?;

      let joinable = slots
        .get(&key)
        .filter(|slot| not_before.map_or(true, |cutoff| slot.started >= cutoff))
        .map(|slot| (slot.generation, slot.work.clone()));

      match joinable {
        Some(joined) => {
          tracing::debug!(%key, "joining sync already in flight");
          joined
        }
        None => {
          if slots.contains_key(&key) {
            tracing::debug!(%key, "sync in flight predates reconnect, starting another");
          }
          let generation = self.generation.fetch_add(1, Ordering::Relaxed);
          let work = start().shared();
          slots.insert(
            key.clone(),
            Slot {
              generation,
              started: Instant::now(),
              work: work.clone(),
            },
          );
          (generation, work)
        }
      }
    };

    let outcome = work.await;

    if let Ok(mut slots) = self.slots.lock() {
      if slots.get(&key).map(|slot| slot.generation) == Some(generation) {
        slots.remove(&key);
      }
    }

    outcome
  }

  /// Number of keys with work in flight.
  #[allow(dead_code)]
  pub fn len(&self) -> usize {
    self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
  }
}
