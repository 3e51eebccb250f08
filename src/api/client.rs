use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::cache::EntityKind;
use crate::config::Config;

use super::RemoteSource;

/// HTTP client for the document API.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(secs) = config.api.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }
    let http = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: base_url(&config.api.url)?,
      token: Config::get_api_token(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Full url of a kind's collection resource.
  fn resource_url(&self, kind: EntityKind) -> Result<Url> {
    self
      .base_url
      .join(kind.resource_path())
      .map_err(|e| eyre!("Invalid resource path for {}: {}", kind, e))
  }

  fn get(&self, url: Url) -> reqwest::RequestBuilder {
    let request = self.http.get(url);
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  /// Cheap reachability check against the base url.
  ///
  /// Any HTTP response counts as reachable; only transport errors do not.
  pub async fn ping(&self) -> bool {
    self.get(self.base_url.clone()).send().await.is_ok()
  }
}

#[async_trait]
impl RemoteSource for ApiClient {
  async fn fetch(&self, kind: EntityKind, params: &BTreeMap<String, String>) -> Result<Vec<Value>> {
    let url = self.resource_url(kind)?;
    tracing::debug!(%kind, %url, ?params, "fetching");

    let response = self
      .get(url)
      .query(params)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", kind, e))?
      .error_for_status()
      .map_err(|e| eyre!("Failed to fetch {}: {}", kind, e))?;

    let body: Value = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", kind, e))?;

    match body {
      Value::Array(items) => Ok(items),
      other => Err(eyre!(
        "Expected a JSON array of {}, got {}",
        kind,
        json_type(&other)
      )),
    }
  }
}

/// Parse the configured base url, making sure relative joins keep its path.
fn base_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid API url '{}': {}", raw, e))?;
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  Ok(url)
}

fn json_type(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let url = base_url("https://invoices.example.com/api").unwrap();
    assert_eq!(url.as_str(), "https://invoices.example.com/api/");
    assert_eq!(
      url.join("address-book").unwrap().as_str(),
      "https://invoices.example.com/api/address-book"
    );
  }

  #[test]
  fn test_base_url_rejects_garbage() {
    assert!(base_url("not a url").is_err());
  }
}
