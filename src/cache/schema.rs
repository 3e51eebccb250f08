//! Versioned schema for the persistent store.
//!
//! Each entry upgrades the database from `version - 1` to `version`.
//! Migrations only ever add tables or indexes; anything destructive has to go
//! through a cache epoch bump instead.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;

pub struct Migration {
  pub version: u32,
  pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    sql: r#"
-- One table per entity kind. data holds the full JSON payload.
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_updated ON users(updated_at);

CREATE TABLE IF NOT EXISTS address_book (
    id INTEGER PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_address_book_updated ON address_book(updated_at);
"#,
  },
  Migration {
    version: 2,
    sql: r#"
-- Which ids each query fingerprint returned at its last reconciliation
CREATE TABLE IF NOT EXISTS query_members (
    kind TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    id INTEGER NOT NULL,
    PRIMARY KEY (kind, fingerprint, id)
);
CREATE INDEX IF NOT EXISTS idx_query_members_id ON query_members(kind, id);
"#,
  },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> u32 {
  MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Bring the database up to the latest version. Safe to run on every open.
pub fn migrate(conn: &mut Connection) -> Result<u32> {
  let current: u32 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin migration: {}", e))?;
    tx.execute_batch(migration.sql)
      .map_err(|e| eyre!("Failed to apply schema v{}: {}", migration.version, e))?;
    tx.pragma_update(None, "user_version", migration.version)
      .map_err(|e| eyre!("Failed to record schema v{}: {}", migration.version, e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit schema v{}: {}", migration.version, e))?;
    tracing::debug!(version = migration.version, "applied cache schema migration");
  }

  Ok(current.max(latest_version()))
}
