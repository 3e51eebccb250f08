//! SQLite-backed persistent store with one table per entity kind.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use super::schema;
use super::traits::{CachedRecord, Entity, EntityKind};

/// SQLite-based entity store.
///
/// All tables share one connection. Every write goes through a transaction,
/// so callers either see all of a batch or none of it.
pub struct Store {
  conn: Mutex<Connection>,
}

impl Store {
  /// Open (or create) the store at `path` and bring its schema up to date.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    let version = schema::migrate(&mut conn)?;
    tracing::debug!(version, "cache store ready");
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get a single row by id.
  pub fn get<T: Entity>(&self, id: i64) -> Result<Option<CachedRecord<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT id, data, updated_at FROM {} WHERE id = ?",
      T::KIND.table()
    );
    let row: Option<(i64, String, String)> = conn
      .query_row(&sql, params![id], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {} {}: {}", T::KIND, id, e))?;

    match row {
      Some((id, data, updated_at)) => {
        let data: T = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize {} {}: {}", T::KIND, id, e))?;
        Ok(Some(CachedRecord {
          id,
          data,
          updated_at,
        }))
      }
      None => Ok(None),
    }
  }

  /// Get every row of the entity's table, ordered by id.
  pub fn get_all<T: Entity>(&self) -> Result<Vec<CachedRecord<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT id, data, updated_at FROM {} ORDER BY id",
      T::KIND.table()
    );
    read_records(&conn, &sql, [])
  }

  /// Get the rows a query fingerprint returned at its last reconciliation.
  pub fn get_members<T: Entity>(&self, fingerprint: &str) -> Result<Vec<CachedRecord<T>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sql = format!(
      "SELECT t.id, t.data, t.updated_at FROM {} t
       INNER JOIN query_members qm ON qm.kind = ? AND qm.fingerprint = ? AND qm.id = t.id
       ORDER BY t.id",
      T::KIND.table()
    );
    read_records(&conn, &sql, params![T::KIND.as_str(), fingerprint])
  }

  /// Insert or overwrite rows by id, atomically.
  pub fn put_many<T: Entity>(&self, records: &[CachedRecord<T>]) -> Result<()> {
    self.transaction(&[T::KIND], |tx| tx.put(records))
  }

  /// Delete rows by id, atomically. Missing ids are ignored.
  #[allow(dead_code)]
  pub fn delete_many(&self, kind: EntityKind, ids: &[i64]) -> Result<()> {
    self.transaction(&[kind], |tx| tx.delete(kind, ids))
  }

  /// Run `f` inside a single transaction restricted to `kinds`.
  ///
  /// Commits when `f` returns `Ok`; any error rolls every write back.
  pub fn transaction<R>(
    &self,
    kinds: &[EntityKind],
    f: impl FnOnce(&StoreTx<'_>) -> Result<R>,
  ) -> Result<R> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let store_tx = StoreTx {
      tx,
      kinds: kinds.to_vec(),
    };

    let value = f(&store_tx)?;

    store_tx
      .tx
      .commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(value)
  }
}

/// Write access to a set of entity tables within one transaction.
pub struct StoreTx<'a> {
  tx: Transaction<'a>,
  kinds: Vec<EntityKind>,
}

impl StoreTx<'_> {
  fn check(&self, kind: EntityKind) -> Result<&'static str> {
    if self.kinds.contains(&kind) {
      Ok(kind.table())
    } else {
      Err(eyre!("Table {} is not part of this transaction", kind.table()))
    }
  }

  /// Upsert full rows.
  pub fn put<T: Entity>(&self, records: &[CachedRecord<T>]) -> Result<()> {
    let table = self.check(T::KIND)?;
    let mut stmt = self
      .tx
      .prepare_cached(&format!(
        "INSERT OR REPLACE INTO {} (id, data, updated_at) VALUES (?, ?, ?)",
        table
      ))
      .map_err(|e| eyre!("Failed to prepare upsert: {}", e))?;

    for record in records {
      let data = serde_json::to_string(&record.data)
        .map_err(|e| eyre!("Failed to serialize {} {}: {}", T::KIND, record.id, e))?;
      stmt
        .execute(params![record.id, data, record.updated_at])
        .map_err(|e| eyre!("Failed to store {} {}: {}", T::KIND, record.id, e))?;
    }
    Ok(())
  }

  /// Delete rows and every query membership pointing at them.
  pub fn delete(&self, kind: EntityKind, ids: &[i64]) -> Result<()> {
    let table = self.check(kind)?;
    let mut delete_row = self
      .tx
      .prepare_cached(&format!("DELETE FROM {} WHERE id = ?", table))
      .map_err(|e| eyre!("Failed to prepare delete: {}", e))?;
    let mut delete_membership = self
      .tx
      .prepare_cached("DELETE FROM query_members WHERE kind = ? AND id = ?")
      .map_err(|e| eyre!("Failed to prepare delete: {}", e))?;

    for id in ids {
      delete_row
        .execute(params![id])
        .map_err(|e| eyre!("Failed to delete {} {}: {}", kind, id, e))?;
      delete_membership
        .execute(params![kind.as_str(), id])
        .map_err(|e| eyre!("Failed to delete {} {} membership: {}", kind, id, e))?;
    }
    Ok(())
  }

  /// Every id currently in the table.
  pub fn ids(&self, kind: EntityKind) -> Result<HashSet<i64>> {
    let table = self.check(kind)?;
    let mut stmt = self
      .tx
      .prepare(&format!("SELECT id FROM {}", table))
      .map_err(|e| eyre!("Failed to prepare id scan: {}", e))?;
    let ids = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to scan {} ids: {}", kind, e))?
      .collect::<rusqlite::Result<HashSet<i64>>>()
      .map_err(|e| eyre!("Failed to read {} id: {}", kind, e))?;
    Ok(ids)
  }

  /// Ids recorded for `fingerprint` at its last reconciliation.
  pub fn members(&self, kind: EntityKind, fingerprint: &str) -> Result<HashSet<i64>> {
    self.check(kind)?;
    let mut stmt = self
      .tx
      .prepare("SELECT id FROM query_members WHERE kind = ? AND fingerprint = ?")
      .map_err(|e| eyre!("Failed to prepare membership scan: {}", e))?;
    let ids = stmt
      .query_map(params![kind.as_str(), fingerprint], |row| row.get(0))
      .map_err(|e| eyre!("Failed to scan memberships: {}", e))?
      .collect::<rusqlite::Result<HashSet<i64>>>()
      .map_err(|e| eyre!("Failed to read membership: {}", e))?;
    Ok(ids)
  }

  /// Replace the membership set of `fingerprint`.
  pub fn set_members(&self, kind: EntityKind, fingerprint: &str, ids: &[i64]) -> Result<()> {
    self.check(kind)?;
    self
      .tx
      .execute(
        "DELETE FROM query_members WHERE kind = ? AND fingerprint = ?",
        params![kind.as_str(), fingerprint],
      )
      .map_err(|e| eyre!("Failed to clear memberships: {}", e))?;

    let mut stmt = self
      .tx
      .prepare_cached(
        "INSERT OR IGNORE INTO query_members (kind, fingerprint, id) VALUES (?, ?, ?)",
      )
      .map_err(|e| eyre!("Failed to prepare membership insert: {}", e))?;
    for id in ids {
      stmt
        .execute(params![kind.as_str(), fingerprint, id])
        .map_err(|e| eyre!("Failed to record membership: {}", e))?;
    }
    Ok(())
  }

  /// Whether any fingerprint other than `fingerprint` still lists `id`.
  pub fn claimed_elsewhere(&self, kind: EntityKind, fingerprint: &str, id: i64) -> Result<bool> {
    self.check(kind)?;
    let count: i64 = self
      .tx
      .query_row(
        "SELECT COUNT(*) FROM query_members WHERE kind = ? AND id = ? AND fingerprint != ?",
        params![kind.as_str(), id, fingerprint],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to check membership: {}", e))?;
    Ok(count > 0)
  }
}

fn read_records<T: Entity, P: rusqlite::Params>(
  conn: &Connection,
  sql: &str,
  params: P,
) -> Result<Vec<CachedRecord<T>>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows: Vec<(i64, String, String)> = stmt
    .query_map(params, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
    .map_err(|e| eyre!("Failed to query {}: {}", T::KIND, e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read {} row: {}", T::KIND, e))?;

  let records = rows
    .into_iter()
    .filter_map(|(id, data, updated_at)| match serde_json::from_str(&data) {
      Ok(data) => Some(CachedRecord {
        id,
        data,
        updated_at,
      }),
      Err(e) => {
        tracing::warn!(kind = %T::KIND, id, error = %e, "skipping undecodable cached row");
        None
      }
    })
    .collect();

  Ok(records)
}
