//! What a controller publishes to its consumers.

/// Indicates where the published data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Nothing has been loaded yet
  None,
  /// Rows read from the local store, possibly stale
  Cache,
  /// Result of the latest successful remote fetch
  Network,
}

/// `{ data, loading, error }` as seen by a consumer.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub data: Vec<T>,
  pub loading: bool,
  pub error: Option<String>,
  pub source: DataSource,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      data: Vec::new(),
      loading: false,
      error: None,
      source: DataSource::None,
    }
  }
}

impl<T> QueryState<T> {
  #[allow(dead_code)]
  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  /// Cached rows published at the start of a load.
  pub(crate) fn cached(data: Vec<T>, error: Option<String>) -> Self {
    Self {
      data,
      loading: true,
      error,
      source: DataSource::Cache,
    }
  }

  /// Fresh rows after a successful reconciliation.
  pub(crate) fn fresh(data: Vec<T>) -> Self {
    Self {
      data,
      loading: false,
      error: None,
      source: DataSource::Network,
    }
  }

  /// Keep whatever data was shown and attach the failure.
  pub(crate) fn failed(mut self, error: String) -> Self {
    self.loading = false;
    self.error = Some(error);
    self
  }
}
