//! Query descriptions and their fingerprints.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::cache::EntityKind;

/// Fingerprint shared by every unfiltered query of a kind.
pub const UNFILTERED: &str = "all";

/// What a controller asks the remote for: a kind plus filter params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
  kind: EntityKind,
  params: BTreeMap<String, String>,
}

impl Query {
  /// The full collection of a kind.
  pub fn all(kind: EntityKind) -> Self {
    Self {
      kind,
      params: BTreeMap::new(),
    }
  }

  /// Add a filter parameter. Keys are lowercased; blank values are dropped.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    let key = key.into().trim().to_lowercase();
    let value = value.into().trim().to_string();
    if !key.is_empty() && !value.is_empty() {
      self.params.insert(key, value);
    }
    self
  }

  /// Parse `key=value` pairs, as given on the command line.
  pub fn parse(kind: EntityKind, filters: &[String]) -> Result<Self, String> {
    filters.iter().try_fold(Self::all(kind), |query, filter| {
      match filter.split_once('=') {
        Some((key, value)) => Ok(query.with(key, value)),
        None => Err(format!("filter '{}' is not of the form key=value", filter)),
      }
    })
  }

  pub fn kind(&self) -> EntityKind {
    self.kind
  }

  pub fn params(&self) -> &BTreeMap<String, String> {
    &self.params
  }

  /// True when the query asks for the whole collection.
  pub fn is_unfiltered(&self) -> bool {
    self.params.is_empty()
  }

  /// Stable identifier of this query within its kind.
  ///
  /// Parameter order does not matter.
  pub fn fingerprint(&self) -> String {
    if self.is_unfiltered() {
      return UNFILTERED.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(self.kind.as_str().as_bytes());
    for (key, value) in &self.params {
      hasher.update(b"\0");
      hasher.update(key.as_bytes());
      hasher.update(b"=");
      hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for Query {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.params.is_empty() {
      return write!(f, "all {}", self.kind);
    }
    let filters: Vec<String> = self
      .params
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect();
    write!(f, "{} where {}", self.kind, filters.join(", "))
  }
}
