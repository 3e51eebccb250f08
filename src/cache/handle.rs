//! Lazily opened, process-wide access to the persistent store.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::storage::Store;

/// Shared handle to the store at a fixed path.
///
/// The database is opened on first `get()` and the same `Arc<Store>` is handed
/// to every caller afterwards. Clones share the same slot.
#[derive(Clone)]
pub struct StoreHandle {
  path: PathBuf,
  slot: Arc<Mutex<Option<Arc<Store>>>>,
}

impl StoreHandle {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      slot: Arc::new(Mutex::new(None)),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Get the open store, opening it if this is the first access.
  pub fn get(&self) -> Result<Arc<Store>> {
    let mut slot = self
      .slot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(store) = slot.as_ref() {
      return Ok(Arc::clone(store));
    }

    let store = Arc::new(Store::open(&self.path)?);
    tracing::debug!(path = %self.path.display(), "opened cache store");
    *slot = Some(Arc::clone(&store));
    Ok(store)
  }

  /// Drop the cached connection and delete the database files.
  ///
  /// The next `get()` recreates an empty store. Callers still holding an
  /// `Arc<Store>` from before keep a connection to the unlinked file.
  pub fn destroy(&self) -> Result<()> {
    let mut slot = self
      .slot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    slot.take();

    for path in self.files() {
      match std::fs::remove_file(&path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed cache file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(eyre!("Failed to remove {}: {}", path.display(), e)),
      }
    }
    Ok(())
  }

  /// The database file plus SQLite's journal side files.
  fn files(&self) -> Vec<PathBuf> {
    let mut files = vec![self.path.clone()];
    for suffix in ["-wal", "-shm", "-journal"] {
      let mut name = self.path.clone().into_os_string();
      name.push(suffix);
      files.push(PathBuf::from(name));
    }
    files
  }
}
