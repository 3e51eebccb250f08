//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::str::FromStr;

/// Entity kinds known to the cache. Each kind owns exactly one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
  Documents,
  Users,
  AddressBook,
}

impl EntityKind {
  pub const ALL: [EntityKind; 3] = [
    EntityKind::Documents,
    EntityKind::Users,
    EntityKind::AddressBook,
  ];

  /// Table name inside the persistent store.
  pub fn table(self) -> &'static str {
    match self {
      EntityKind::Documents => "documents",
      EntityKind::Users => "users",
      EntityKind::AddressBook => "address_book",
    }
  }

  /// Resource path on the remote API, relative to the base url.
  pub fn resource_path(self) -> &'static str {
    match self {
      EntityKind::Documents => "documents",
      EntityKind::Users => "users",
      EntityKind::AddressBook => "address-book",
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      EntityKind::Documents => "documents",
      EntityKind::Users => "users",
      EntityKind::AddressBook => "address-book",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "documents" | "document" | "docs" | "invoices" => Ok(EntityKind::Documents),
      "users" | "user" => Ok(EntityKind::Users),
      "address-book" | "address_book" | "addressbook" | "contacts" => Ok(EntityKind::AddressBook),
      other => Err(format!("unknown entity kind '{}'", other)),
    }
  }
}

/// Trait for entities that can be cached.
///
/// Implementors carry a numeric id (the table's primary key) and optionally
/// an updated_at timestamp, which is only used as a secondary index.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// The kind, and therefore the table, this entity lives in.
  const KIND: EntityKind;

  fn id(&self) -> i64;

  /// Last modification timestamp as reported by the server.
  fn updated_at(&self) -> Option<&str>;
}

/// A row of an entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord<T> {
  pub id: i64,
  pub data: T,
  pub updated_at: String,
}

impl<T: Entity> CachedRecord<T> {
  /// Wrap an entity fetched from the server. A missing timestamp becomes now.
  pub fn from_entity(data: T) -> Self {
    let updated_at = data
      .updated_at()
      .map(String::from)
      .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    Self {
      id: data.id(),
      data,
      updated_at,
    }
  }
}
