//! Re-sync every live controller when connectivity comes back.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::Entity;
use crate::event::ConnectivityEvent;
use crate::sync::SyncController;

/// Something whose load can be re-run.
pub trait Reload: Send + Sync {
  /// Load again, without joining any sync that started before `since`.
  fn reload(&self, since: Instant) -> JoinHandle<()>;

  fn describe(&self) -> String;
}

/// Registry of active controllers.
///
/// Holds weak references only; a dropped controller is forgotten on the next
/// signal.
#[derive(Clone, Default)]
pub struct ConnectivityWatcher {
  controllers: Arc<Mutex<Vec<Weak<dyn Reload>>>>,
}

impl ConnectivityWatcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<T: Entity>(&self, controller: &SyncController<T>) -> Result<()> {
    let mut controllers = self
      .controllers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    controllers.push(controller.as_reload());
    Ok(())
  }

  /// Controllers still alive.
  fn live(&self) -> Vec<Arc<dyn Reload>> {
    let Ok(mut controllers) = self.controllers.lock() else {
      return Vec::new();
    };
    controllers.retain(|weak| weak.strong_count() > 0);
    controllers.iter().filter_map(Weak::upgrade).collect()
  }

  pub fn active(&self) -> usize {
    self.live().len()
  }

  /// Re-run `load()` on every live controller.
  ///
  /// No debouncing here: each call triggers every controller again, and a
  /// fetch stuck from before the reconnect is never reused.
  pub fn restored(&self) -> Vec<JoinHandle<()>> {
    let since = Instant::now();
    let live = self.live();
    tracing::info!(controllers = live.len(), "connectivity restored, refreshing");
    live
      .iter()
      .map(|controller| {
        tracing::debug!(query = %controller.describe(), "refreshing");
        controller.reload(since)
      })
      .collect()
  }

  /// Consume connectivity events until the sender goes away.
  pub fn spawn(self, mut events: mpsc::UnboundedReceiver<ConnectivityEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      while let Some(event) = events.recv().await {
        match event {
          ConnectivityEvent::Restored => {
            self.restored();
          }
          ConnectivityEvent::Lost => {
            tracing::info!("connectivity lost, serving cached data");
          }
        }
      }
    })
  }
}
