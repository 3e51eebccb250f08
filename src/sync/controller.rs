//! Entity sync controller: serve the cache, then reconcile with the server.

use color_eyre::{eyre::eyre, Result};
use futures::FutureExt;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::RemoteSource;
use crate::cache::{CachedRecord, Entity, StoreHandle};
use crate::config::SyncConfig;
use crate::connectivity::Reload;

use super::inflight::{InFlight, SyncOutcome};
use super::query::Query;
use super::reconcile::{reconcile, PruneScope};
use super::state::QueryState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
  pub prune_scope: PruneScope,
  pub coalesce: bool,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      prune_scope: PruneScope::default(),
      coalesce: true,
    }
  }
}

impl From<&SyncConfig> for SyncOptions {
  fn from(config: &SyncConfig) -> Self {
    Self {
      prune_scope: config.prune_scope,
      coalesce: config.coalesce,
    }
  }
}

/// Keeps one entity table approximately consistent with what the server
/// reports for one query, and publishes the result to subscribers.
///
/// Dropping every subscription stops publication but never cancels a sync
/// already running; its store write still lands.
pub struct SyncController<T: Entity> {
  inner: Arc<Inner<T>>,
}

struct Inner<T: Entity> {
  query: Query,
  store: StoreHandle,
  remote: Arc<dyn RemoteSource>,
  options: SyncOptions,
  inflight: InFlight,
  state: Arc<watch::Sender<QueryState<T>>>,
}

impl<T: Entity> SyncController<T> {
  pub fn new(
    query: Query,
    store: StoreHandle,
    remote: Arc<dyn RemoteSource>,
    inflight: InFlight,
    options: SyncOptions,
  ) -> Result<Self> {
    if query.kind() != T::KIND {
      return Err(eyre!(
        "Query for {} cannot drive a {} controller",
        query.kind(),
        T::KIND
      ));
    }

    let (state, _) = watch::channel(QueryState::default());
    Ok(Self {
      inner: Arc::new(Inner {
        query,
        store,
        remote,
        options,
        inflight,
        state: Arc::new(state),
      }),
    })
  }

  pub fn query(&self) -> &Query {
    &self.inner.query
  }

  /// Subscribe to published states. The current state is visible immediately.
  pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
    self.inner.state.subscribe()
  }

  /// Publish cached rows now, then fetch and reconcile in the background.
  ///
  /// The returned handle completes once the fetch outcome is published.
  pub fn load(&self) -> JoinHandle<()> {
    self.inner.publish_cached();
    self.inner.spawn_refresh(None)
  }

  pub(crate) fn as_reload(&self) -> std::sync::Weak<dyn Reload> {
    let inner: Arc<dyn Reload> = self.inner.clone();
    Arc::downgrade(&inner)
  }
}

impl<T: Entity> Inner<T> {
  /// Step 1: whatever the store holds for this query, no network.
  fn publish_cached(&self) {
    let previous_error = self.state.borrow().error.clone();
    match self.read_cached() {
      Ok(rows) => {
        tracing::debug!(query = %self.query, rows = rows.len(), "serving cached rows");
        let data = rows.into_iter().map(|record| record.data).collect();
        publish(&self.state, QueryState::cached(data, previous_error));
      }
      Err(e) => {
        tracing::warn!(query = %self.query, error = %e, "cache read failed");
        let current = self.state.borrow().clone();
        let mut state = current.failed(e.to_string());
        state.loading = true;
        publish(&self.state, state);
      }
    }
  }

  fn read_cached(&self) -> Result<Vec<CachedRecord<T>>> {
    let store = self.store.get()?;
    if self.options.prune_scope == PruneScope::Fingerprint && !self.query.is_unfiltered() {
      store.get_members(&self.query.fingerprint())
    } else {
      store.get_all()
    }
  }

  /// `not_before` keeps the fetch from joining a coalesced sync that started
  /// earlier.
  fn spawn_refresh(&self, not_before: Option<Instant>) -> JoinHandle<()> {
    let refresh = Refresh::<T> {
      query: self.query.clone(),
      store: self.store.clone(),
      remote: Arc::clone(&self.remote),
      options: self.options,
      inflight: self.inflight.clone(),
      state: Arc::clone(&self.state),
      not_before,
      _entity: PhantomData,
    };
    tokio::spawn(refresh.run())
  }
}

impl<T: Entity> Reload for Inner<T> {
  fn reload(&self, since: Instant) -> JoinHandle<()> {
    self.publish_cached();
    self.spawn_refresh(Some(since))
  }

  fn describe(&self) -> String {
    self.query.to_string()
  }
}

/// Everything a background sync needs, detached from the controller so an
/// in-flight sync does not keep the controller registered as active.
struct Refresh<T: Entity> {
  query: Query,
  store: StoreHandle,
  remote: Arc<dyn RemoteSource>,
  options: SyncOptions,
  inflight: InFlight,
  state: Arc<watch::Sender<QueryState<T>>>,
  not_before: Option<Instant>,
  _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Refresh<T> {
  async fn run(self) {
    let outcome = if self.options.coalesce {
      let key = format!("{}/{}", self.query.kind(), self.query.fingerprint());
      let work = || {
        sync_once::<T>(
          self.query.clone(),
          self.store.clone(),
          Arc::clone(&self.remote),
          self.options.prune_scope,
        )
        .boxed()
      };
      self.inflight.run(key, self.not_before, work).await
    } else {
      sync_once::<T>(
        self.query.clone(),
        self.store.clone(),
        Arc::clone(&self.remote),
        self.options.prune_scope,
      )
      .await
    };

    let result = outcome.and_then(|values| decode::<T>(&values).map_err(|e| e.to_string()));

    if self.state.is_closed() {
      tracing::debug!(query = %self.query, "no subscribers left, result not delivered");
    }

    match result {
      Ok(data) => publish(&self.state, QueryState::fresh(data)),
      Err(error) => {
        tracing::warn!(query = %self.query, %error, "sync failed, keeping cached rows");
        let current = self.state.borrow().clone();
        publish(&self.state, current.failed(error));
      }
    }
  }
}

/// Steps 2 and 3: fetch, then upsert and prune in one transaction.
async fn sync_once<T: Entity>(
  query: Query,
  store: StoreHandle,
  remote: Arc<dyn RemoteSource>,
  scope: PruneScope,
) -> SyncOutcome {
  let values = remote
    .fetch(query.kind(), query.params())
    .await
    .map_err(|e| e.to_string())?;

  let records: Vec<CachedRecord<T>> = decode::<T>(&values)
    .map_err(|e| e.to_string())?
    .into_iter()
    .map(CachedRecord::from_entity)
    .collect();

  let store = store.get().map_err(|e| e.to_string())?;
  let write_query = query.clone();
  let report = tokio::task::spawn_blocking(move || {
    store.transaction(&[T::KIND], |tx| reconcile(tx, &write_query, &records, scope))
  })
  .await
  .map_err(|e| format!("Store write task failed: {}", e))?
  .map_err(|e| e.to_string())?;

  tracing::debug!(
    query = %query,
    upserted = report.upserted,
    pruned = report.pruned.len(),
    "reconciled"
  );
  Ok(Arc::new(values))
}

fn decode<T: Entity>(values: &[Value]) -> Result<Vec<T>> {
  values
    .iter()
    .map(|value| {
      serde_json::from_value(value.clone())
        .map_err(|e| eyre!("Invalid {} in response: {}", T::KIND, e))
    })
    .collect()
}

/// Replace the published state. Without subscribers this only updates the
/// value a later subscriber starts from.
fn publish<T>(state: &watch::Sender<QueryState<T>>, next: QueryState<T>) {
  state.send_replace(next);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::Document;
  use crate::cache::EntityKind;
  use crate::sync::DataSource;
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;
  use tokio::sync::Semaphore;

  /// In-memory server: filters rows by `status` when asked to.
  struct FakeRemote {
    rows: Mutex<Vec<Value>>,
    fail: AtomicBool,
    hang: bool,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
  }

  impl FakeRemote {
    fn new(rows: Vec<Value>) -> Self {
      Self {
        rows: Mutex::new(rows),
        fail: AtomicBool::new(false),
        hang: false,
        gate: None,
        calls: AtomicUsize::new(0),
      }
    }

    fn set_rows(&self, rows: Vec<Value>) {
      *self.rows.lock().unwrap() = rows;
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl RemoteSource for FakeRemote {
    async fn fetch(
      &self,
      _kind: EntityKind,
      params: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.hang {
        futures::future::pending::<()>().await;
      }
      if let Some(gate) = &self.gate {
        let _permit = gate.acquire().await?;
      }
      if self.fail.load(Ordering::SeqCst) {
        return Err(eyre!("Failed to fetch documents: connection refused"));
      }
      let rows = self.rows.lock().unwrap().clone();
      Ok(match params.get("status") {
        Some(status) => rows
          .into_iter()
          .filter(|row| row["status"].as_str() == Some(status.as_str()))
          .collect(),
        None => rows,
      })
    }
  }

  struct Fixture {
    _dir: tempfile::TempDir,
    store: StoreHandle,
    inflight: InFlight,
  }

  fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreHandle::new(dir.path().join("cache.db"));
    Fixture {
      _dir: dir,
      store,
      inflight: InFlight::new(),
    }
  }

  impl Fixture {
    fn controller(
      &self,
      query: Query,
      remote: &Arc<FakeRemote>,
      options: SyncOptions,
    ) -> SyncController<Document> {
      let remote: Arc<dyn RemoteSource> = remote.clone();
      SyncController::new(query, self.store.clone(), remote, self.inflight.clone(), options)
        .unwrap()
    }

    fn all_documents(&self, remote: &Arc<FakeRemote>) -> SyncController<Document> {
      self.controller(Query::all(EntityKind::Documents), remote, SyncOptions::default())
    }

    fn seed(&self, rows: &[Value]) {
      let records: Vec<CachedRecord<Document>> = rows
        .iter()
        .map(|row| CachedRecord::from_entity(serde_json::from_value(row.clone()).unwrap()))
        .collect();
      let store = self.store.get().unwrap();
      let query = Query::all(EntityKind::Documents);
      store
        .transaction(&[EntityKind::Documents], |tx| {
          reconcile(tx, &query, &records, PruneScope::Fingerprint)
        })
        .unwrap();
    }

    fn ids(&self) -> Vec<i64> {
      self
        .store
        .get()
        .unwrap()
        .get_all::<Document>()
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect()
    }
  }

  fn doc(id: i64, status: &str) -> Value {
    json!({ "id": id, "status": status, "updated_at": "2024-03-01T12:00:00Z" })
  }

  fn ids_of(state: &QueryState<Document>) -> Vec<i64> {
    state.data.iter().map(|d| d.id).collect()
  }

  #[tokio::test]
  async fn test_unfiltered_load_converges() {
    let f = fixture();
    f.seed(&[doc(1, "paid"), doc(2, "paid"), doc(3, "paid")]);
    let remote = Arc::new(FakeRemote::new(vec![doc(2, "unpaid"), doc(3, "paid"), doc(4, "paid")]));
    let controller = f.all_documents(&remote);
    let rx = controller.subscribe();

    controller.load().await.unwrap();

    assert_eq!(f.ids(), vec![2, 3, 4]);
    let state = rx.borrow();
    assert_eq!(ids_of(&state), vec![2, 3, 4]);
    assert_eq!(state.source, DataSource::Network);
    assert!(!state.loading);
    assert!(state.error.is_none());
  }

  #[tokio::test]
  async fn test_cached_rows_published_before_fetch_resolves() {
    let f = fixture();
    f.seed(&[doc(1, "paid")]);
    let remote = Arc::new(FakeRemote {
      hang: true,
      ..FakeRemote::new(vec![])
    });
    let controller = f.all_documents(&remote);
    let rx = controller.subscribe();

    let handle = controller.load();

    {
      let state = rx.borrow();
      assert_eq!(ids_of(&state), vec![1]);
      assert!(state.loading);
      assert_eq!(state.source, DataSource::Cache);
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(rx.borrow().loading);
    assert_eq!(remote.calls(), 1);
    handle.abort();
  }

  #[tokio::test]
  async fn test_failed_fetch_preserves_cache() {
    let f = fixture();
    f.seed(&[doc(1, "paid"), doc(2, "unpaid")]);
    let before = f.store.get().unwrap().get_all::<Document>().unwrap();
    let remote = Arc::new(FakeRemote::new(vec![doc(9, "paid")]));
    remote.fail.store(true, Ordering::SeqCst);
    let controller = f.all_documents(&remote);
    let rx = controller.subscribe();

    controller.load().await.unwrap();

    let after = f.store.get().unwrap().get_all::<Document>().unwrap();
    assert_eq!(before, after);
    let state = rx.borrow();
    assert!(state.error().unwrap().contains("connection refused"));
    assert_eq!(ids_of(&state), vec![1, 2]);
    assert!(!state.loading);
  }

  #[tokio::test]
  async fn test_failed_store_write_preserves_cache() {
    let f = fixture();
    f.seed(&[doc(1, "paid"), doc(2, "unpaid")]);
    let before = f.store.get().unwrap().get_all::<Document>().unwrap();
    let conn = rusqlite::Connection::open(f.store.path()).unwrap();
    conn
      .execute_batch(
        "CREATE TRIGGER reject_documents BEFORE INSERT ON documents
         BEGIN SELECT RAISE(ABORT, 'documents are read-only'); END;",
      )
      .unwrap();
    drop(conn);
    let remote = Arc::new(FakeRemote::new(vec![doc(1, "unpaid"), doc(3, "paid")]));
    let controller = f.all_documents(&remote);
    let rx = controller.subscribe();

    controller.load().await.unwrap();

    let after = f.store.get().unwrap().get_all::<Document>().unwrap();
    assert_eq!(before, after);
    let state = rx.borrow();
    assert!(state.error().unwrap().contains("read-only"));
    assert!(!state.loading);
    assert_eq!(state.source, DataSource::Cache);
    assert_eq!(ids_of(&state), vec![1, 2]);
  }

  #[tokio::test]
  async fn test_success_clears_previous_error() {
    let f = fixture();
    let remote = Arc::new(FakeRemote::new(vec![doc(1, "paid")]));
    remote.fail.store(true, Ordering::SeqCst);
    let controller = f.all_documents(&remote);
    let rx = controller.subscribe();

    controller.load().await.unwrap();
    assert!(rx.borrow().is_error());

    remote.fail.store(false, Ordering::SeqCst);
    controller.load().await.unwrap();
    assert!(!rx.borrow().is_error());
    assert_eq!(ids_of(&rx.borrow()), vec![1]);
  }

  #[tokio::test]
  async fn test_response_without_id_is_a_fetch_failure() {
    let f = fixture();
    f.seed(&[doc(1, "paid")]);
    let remote = Arc::new(FakeRemote::new(vec![json!({ "status": "paid" })]));
    let controller = f.all_documents(&remote);
    let rx = controller.subscribe();

    controller.load().await.unwrap();

    assert!(rx.borrow().is_error());
    assert_eq!(f.ids(), vec![1]);
  }

  #[tokio::test]
  async fn test_unsubscribed_load_still_warms_cache() {
    let f = fixture();
    let remote = Arc::new(FakeRemote::new(vec![doc(1, "paid"), doc(2, "paid")]));
    let controller = f.all_documents(&remote);
    drop(controller.subscribe());

    let handle = controller.load();
    drop(controller);
    handle.await.unwrap();

    assert_eq!(f.ids(), vec![1, 2]);
  }

  #[tokio::test]
  async fn test_filtered_load_prunes_outside_filter_with_table_scope() {
    let f = fixture();
    f.seed(&[doc(7, "paid")]);
    let rows = vec![doc(5, "unpaid"), doc(6, "unpaid"), doc(7, "paid")];
    let remote = Arc::new(FakeRemote::new(rows));
    let options = SyncOptions {
      prune_scope: PruneScope::Table,
      coalesce: true,
    };
    let unpaid = f.controller(
      Query::all(EntityKind::Documents).with("status", "unpaid"),
      &remote,
      options,
    );

    unpaid.load().await.unwrap();

    // id 7 still exists server-side but is gone from the cache
    assert_eq!(f.ids(), vec![5, 6]);
  }

  #[tokio::test]
  async fn test_filtered_load_keeps_rows_outside_filter_with_fingerprint_scope() {
    let f = fixture();
    f.seed(&[doc(7, "paid")]);
    let rows = vec![doc(5, "unpaid"), doc(6, "unpaid"), doc(7, "paid")];
    let remote = Arc::new(FakeRemote::new(rows));
    let unpaid = f.controller(
      Query::all(EntityKind::Documents).with("status", "unpaid"),
      &remote,
      SyncOptions::default(),
    );
    let rx = unpaid.subscribe();

    unpaid.load().await.unwrap();

    assert_eq!(f.ids(), vec![5, 6, 7]);
    assert_eq!(ids_of(&rx.borrow()), vec![5, 6]);
  }

  #[tokio::test]
  async fn test_filtered_cached_read_is_scoped_to_its_query() {
    let f = fixture();
    let remote = Arc::new(FakeRemote::new(vec![doc(5, "unpaid"), doc(7, "paid")]));
    let all = f.all_documents(&remote);
    let unpaid = f.controller(
      Query::all(EntityKind::Documents).with("status", "unpaid"),
      &remote,
      SyncOptions::default(),
    );
    all.load().await.unwrap();
    unpaid.load().await.unwrap();

    remote.fail.store(true, Ordering::SeqCst);
    let rx = unpaid.subscribe();
    unpaid.load().await.unwrap();

    assert_eq!(ids_of(&rx.borrow()), vec![5]);
  }

  #[tokio::test]
  async fn test_overlapping_loads_coalesce() {
    let f = fixture();
    let gate = Arc::new(Semaphore::new(0));
    let remote = Arc::new(FakeRemote {
      gate: Some(gate.clone()),
      ..FakeRemote::new(vec![doc(1, "paid")])
    });
    let a = f.all_documents(&remote);
    let b = f.all_documents(&remote);
    let rx_b = b.subscribe();

    let first = a.load();
    let second = b.load();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    gate.add_permits(8);
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(remote.calls(), 1);
    assert_eq!(ids_of(&rx_b.borrow()), vec![1]);
  }

  #[tokio::test]
  async fn test_overlapping_loads_without_coalescing_fetch_twice() {
    let f = fixture();
    let gate = Arc::new(Semaphore::new(0));
    let remote = Arc::new(FakeRemote {
      gate: Some(gate.clone()),
      ..FakeRemote::new(vec![doc(1, "paid")])
    });
    let options = SyncOptions {
      prune_scope: PruneScope::Fingerprint,
      coalesce: false,
    };
    let controller = f.controller(Query::all(EntityKind::Documents), &remote, options);

    let first = controller.load();
    let second = controller.load();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    gate.add_permits(8);
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(remote.calls(), 2);
    assert_eq!(f.ids(), vec![1]);
  }

  #[tokio::test]
  async fn test_later_server_state_wins() {
    let f = fixture();
    let remote = Arc::new(FakeRemote::new(vec![doc(1, "paid"), doc(2, "paid")]));
    let controller = f.all_documents(&remote);

    controller.load().await.unwrap();
    remote.set_rows(vec![doc(2, "paid")]);
    controller.load().await.unwrap();

    assert_eq!(f.ids(), vec![2]);
  }

  #[test]
  fn test_mismatched_kind_is_rejected() {
    let f = fixture();
    let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(vec![]));
    let result = SyncController::<Document>::new(
      Query::all(EntityKind::Users),
      f.store.clone(),
      remote,
      InFlight::new(),
      SyncOptions::default(),
    );
    assert!(result.is_err());
  }
}
