use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::api::types::{AddressBookEntry, Document, User};
use crate::api::{ApiClient, RemoteSource};
use crate::cache::{Entity, EntityKind, StoreHandle};
use crate::config::Config;
use crate::connectivity::ConnectivityWatcher;
use crate::epoch::{self, EpochCheck, CURRENT_EPOCH};
use crate::event::ConnectivityProbe;
use crate::settings::SettingsFile;
use crate::sync::{InFlight, Query, QueryState, SyncController, SyncOptions};

/// Wires the store, the API client and the controllers together.
pub struct App {
  config: Config,
  store: StoreHandle,
  settings: SettingsFile,
  api: ApiClient,
  inflight: InFlight,
  watcher: ConnectivityWatcher,
}

impl App {
  /// Build the app and run the cache epoch check.
  pub fn start(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let store = StoreHandle::new(data_dir.join("cache.db"));
    let settings = SettingsFile::new(data_dir.join("settings.json"));

    if let EpochCheck::Reset { previous } = epoch::ensure(&settings, &store, CURRENT_EPOCH)? {
      tracing::info!(?previous, current = CURRENT_EPOCH, "local cache reset");
    }

    let api = ApiClient::new(&config)?;

    Ok(Self {
      config,
      store,
      settings,
      api,
      inflight: InFlight::new(),
      watcher: ConnectivityWatcher::new(),
    })
  }

  fn controller<T: Entity>(&self, query: Query) -> Result<SyncController<T>> {
    let remote: Arc<dyn RemoteSource> = Arc::new(self.api.clone());
    let controller = SyncController::new(
      query,
      self.store.clone(),
      remote,
      self.inflight.clone(),
      SyncOptions::from(&self.config.sync),
    )?;
    self.watcher.register(&controller)?;
    Ok(controller)
  }

  /// One load: print the cached rows count, then the fresh rows.
  pub async fn sync(&self, query: Query) -> Result<()> {
    match query.kind() {
      EntityKind::Documents => self.sync_kind::<Document>(query).await,
      EntityKind::Users => self.sync_kind::<User>(query).await,
      EntityKind::AddressBook => self.sync_kind::<AddressBookEntry>(query).await,
    }
  }

  async fn sync_kind<T: Entity>(&self, query: Query) -> Result<()> {
    let controller = self.controller::<T>(query)?;
    let rx = controller.subscribe();

    let handle = controller.load();
    eprintln!("{}: {} cached", controller.query(), rx.borrow().data.len());
    handle
      .await
      .map_err(|e| eyre!("Sync task failed: {}", e))?;

    let state = rx.borrow().clone();
    print_rows(&state.data)?;
    match state.error() {
      Some(error) => Err(eyre!("{} (showing cached rows)", error)),
      None => Ok(()),
    }
  }

  /// Print cached rows without touching the network.
  pub fn show(&self, kind: EntityKind, id: Option<i64>) -> Result<()> {
    match kind {
      EntityKind::Documents => self.show_kind::<Document>(id),
      EntityKind::Users => self.show_kind::<User>(id),
      EntityKind::AddressBook => self.show_kind::<AddressBookEntry>(id),
    }
  }

  fn show_kind<T: Entity>(&self, id: Option<i64>) -> Result<()> {
    let store = self.store.get()?;
    let rows: Vec<T> = match id {
      Some(id) => store
        .get::<T>(id)?
        .map(|record| vec![record.data])
        .ok_or_else(|| eyre!("No cached {} with id {}", T::KIND, id))?,
      None => store
        .get_all::<T>()?
        .into_iter()
        .map(|record| record.data)
        .collect(),
    };
    print_rows(&rows)
  }

  /// Keep every kind synced, re-syncing whenever the API comes back.
  pub async fn watch(&self, kinds: &[EntityKind]) -> Result<()> {
    let kinds = if kinds.is_empty() {
      EntityKind::ALL.to_vec()
    } else {
      kinds.to_vec()
    };

    for kind in kinds {
      let query = Query::all(kind);
      match kind {
        EntityKind::Documents => self.watch_kind::<Document>(query)?,
        EntityKind::Users => self.watch_kind::<User>(query)?,
        EntityKind::AddressBook => self.watch_kind::<AddressBookEntry>(query)?,
      }
    }

    let api = self.api.clone();
    let interval = Duration::from_secs(self.config.sync.probe_interval_secs.max(1));
    let events = ConnectivityProbe::new(interval).spawn(move || {
      let api = api.clone();
      async move { api.ping().await }
    });
    let watcher = self.watcher.clone().spawn(events);

    eprintln!(
      "watching {} ({} controllers), Ctrl-C to stop",
      self.api.base_url(),
      self.watcher.active()
    );
    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    watcher.abort();
    Ok(())
  }

  /// Start a controller whose lifetime is tied to a printer task.
  fn watch_kind<T: Entity>(&self, query: Query) -> Result<()> {
    let controller = self.controller::<T>(query)?;
    let mut rx = controller.subscribe();
    let _ = controller.load();

    tokio::spawn(async move {
      let controller = controller;
      loop {
        let line = describe(controller.query(), &rx.borrow_and_update());
        println!("{}", line);
        if rx.changed().await.is_err() {
          break;
        }
      }
    });
    Ok(())
  }

  /// Destroy the store and forget the epoch marker.
  pub fn reset(&self) -> Result<()> {
    self.store.destroy()?;
    epoch::clear(&self.settings)?;
    eprintln!("removed {}", self.store.path().display());
    Ok(())
  }
}

fn describe<T>(query: &Query, state: &QueryState<T>) -> String {
  let mut line = format!("{}: {} rows ({:?}", query, state.data.len(), state.source);
  if state.loading {
    line.push_str(", refreshing");
  }
  line.push(')');
  if let Some(error) = state.error() {
    line.push_str(&format!(" error: {}", error));
  }
  line
}

fn print_rows<T: serde::Serialize>(rows: &[T]) -> Result<()> {
  for row in rows {
    let line =
      serde_json::to_string(row).map_err(|e| eyre!("Failed to serialize row: {}", e))?;
    println!("{}", line);
  }
  Ok(())
}
