//! Upsert-then-prune: make a table match the latest remote result.

use color_eyre::Result;
use serde::Deserialize;
use std::collections::HashSet;

use crate::cache::{CachedRecord, Entity, StoreTx};

use super::query::Query;

/// Which rows a reconciliation is allowed to prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneScope {
  /// Prune every row of the table missing from the result, whatever the
  /// query's filter. A filtered query therefore evicts rows that are valid
  /// server-side but outside its filter.
  Table,
  /// Unfiltered queries prune the whole table. Filtered queries only prune
  /// ids they returned last time and no longer return, and keep rows another
  /// query still lists.
  #[default]
  Fingerprint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
  pub upserted: usize,
  pub pruned: Vec<i64>,
}

/// Apply one fetch result inside `tx`.
pub fn reconcile<T: Entity>(
  tx: &StoreTx<'_>,
  query: &Query,
  records: &[CachedRecord<T>],
  scope: PruneScope,
) -> Result<Reconciled> {
  let kind = T::KIND;
  let fingerprint = query.fingerprint();

  tx.put(records)?;

  let fresh: HashSet<i64> = records.iter().map(|r| r.id).collect();
  let mut stale: Vec<i64> = if scope == PruneScope::Table || query.is_unfiltered() {
    tx.ids(kind)?.difference(&fresh).copied().collect()
  } else {
    let mut stale = Vec::new();
    for id in tx.members(kind, &fingerprint)?.difference(&fresh) {
      if !tx.claimed_elsewhere(kind, &fingerprint, *id)? {
        stale.push(*id);
      }
    }
    stale
  };
  stale.sort_unstable();

  tx.delete(kind, &stale)?;
  let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
  tx.set_members(kind, &fingerprint, &ids)?;

  Ok(Reconciled {
    upserted: records.len(),
    pruned: stale,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::Document;
  use crate::cache::{EntityKind, Store};
  use serde_json::json;

  fn doc(id: i64, status: &str) -> CachedRecord<Document> {
    CachedRecord::from_entity(
      serde_json::from_value(json!({ "id": id, "status": status })).unwrap(),
    )
  }

  fn apply(
    store: &Store,
    query: &Query,
    docs: &[CachedRecord<Document>],
    scope: PruneScope,
  ) -> Reconciled {
    store
      .transaction(&[EntityKind::Documents], |tx| reconcile(tx, query, docs, scope))
      .unwrap()
  }

  fn ids(store: &Store) -> Vec<i64> {
    store
      .get_all::<Document>()
      .unwrap()
      .iter()
      .map(|r| r.id)
      .collect()
  }

  #[test]
  fn test_unfiltered_result_replaces_table() {
    let store = Store::open_in_memory().unwrap();
    let all = Query::all(EntityKind::Documents);
    apply(&store, &all, &[doc(1, "paid"), doc(2, "paid"), doc(3, "paid")], PruneScope::Fingerprint);

    let report = apply(
      &store,
      &all,
      &[doc(2, "unpaid"), doc(3, "paid"), doc(4, "paid")],
      PruneScope::Fingerprint,
    );

    assert_eq!(report.pruned, vec![1]);
    assert_eq!(ids(&store), vec![2, 3, 4]);
    let two = store.get::<Document>(2).unwrap().unwrap();
    assert_eq!(two.data.status.as_deref(), Some("unpaid"));
  }

  #[test]
  fn test_filtered_leaves_other_rows_alone() {
    let store = Store::open_in_memory().unwrap();
    apply(
      &store,
      &Query::all(EntityKind::Documents),
      &[doc(5, "unpaid"), doc(7, "paid")],
      PruneScope::Fingerprint,
    );

    let unpaid = Query::all(EntityKind::Documents).with("status", "unpaid");
    apply(&store, &unpaid, &[doc(5, "unpaid"), doc(6, "unpaid")], PruneScope::Fingerprint);

    assert_eq!(ids(&store), vec![5, 6, 7]);
  }

  #[test]
  fn test_filtered_drops_ids_it_no_longer_returns() {
    let store = Store::open_in_memory().unwrap();
    let unpaid = Query::all(EntityKind::Documents).with("status", "unpaid");
    apply(&store, &unpaid, &[doc(5, "unpaid"), doc(6, "unpaid")], PruneScope::Fingerprint);

    let report = apply(&store, &unpaid, &[doc(6, "unpaid")], PruneScope::Fingerprint);

    assert_eq!(report.pruned, vec![5]);
    assert_eq!(ids(&store), vec![6]);
  }

  #[test]
  fn test_filtered_keeps_rows_claimed_by_other_queries() {
    let store = Store::open_in_memory().unwrap();
    let unpaid = Query::all(EntityKind::Documents).with("status", "unpaid");
    let acme = Query::all(EntityKind::Documents).with("search", "acme");
    apply(&store, &unpaid, &[doc(5, "unpaid")], PruneScope::Fingerprint);
    apply(&store, &acme, &[doc(5, "unpaid")], PruneScope::Fingerprint);

    let report = apply(&store, &unpaid, &[], PruneScope::Fingerprint);

    assert!(report.pruned.is_empty());
    assert_eq!(ids(&store), vec![5]);
  }

  #[test]
  fn test_table_scope_prunes_outside_filter() {
    let store = Store::open_in_memory().unwrap();
    apply(
      &store,
      &Query::all(EntityKind::Documents),
      &[doc(7, "paid")],
      PruneScope::Table,
    );

    let unpaid = Query::all(EntityKind::Documents).with("status", "unpaid");
    let report = apply(&store, &unpaid, &[doc(5, "unpaid"), doc(6, "unpaid")], PruneScope::Table);

    assert_eq!(report.pruned, vec![7]);
    assert_eq!(ids(&store), vec![5, 6]);
  }

  #[test]
  fn test_empty_unfiltered_result_clears_table() {
    let store = Store::open_in_memory().unwrap();
    let all = Query::all(EntityKind::Documents);
    apply(&store, &all, &[doc(1, "paid")], PruneScope::Fingerprint);
    apply(&store, &all, &[], PruneScope::Fingerprint);
    assert!(ids(&store).is_empty());
  }
}
