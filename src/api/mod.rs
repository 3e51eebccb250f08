//! Remote document API: the HTTP client and the entity types it returns.

mod client;
pub mod types;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::cache::EntityKind;

pub use client::ApiClient;

/// Anything that can list the entities of a kind for a set of query params.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  async fn fetch(&self, kind: EntityKind, params: &BTreeMap<String, String>) -> Result<Vec<Value>>;
}
