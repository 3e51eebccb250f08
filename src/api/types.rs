//! Entity types returned by the document API.
//!
//! Only the fields the sync layer or the CLI look at are typed. Everything
//! else is kept in `extra` so the cache stores the full server representation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{Entity, EntityKind};

/// An inbox document or invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A user of the tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A counterparty in the address book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressBookEntry {
  pub id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub city: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Entity for Document {
  const KIND: EntityKind = EntityKind::Documents;

  fn id(&self) -> i64 {
    self.id
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }
}

impl Entity for User {
  const KIND: EntityKind = EntityKind::Users;

  fn id(&self) -> i64 {
    self.id
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }
}

impl Entity for AddressBookEntry {
  const KIND: EntityKind = EntityKind::AddressBook;

  fn id(&self) -> i64 {
    self.id
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }
}
