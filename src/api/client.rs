use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::FetchError;
use crate::config::{ApiConfig, Config};
use crate::lifecycle::Connectivity;
use crate::storage::{DurableStore, LocalStorage};

/// Storage key of the bearer token.
pub const AUTH_TOKEN_KEY: &str = "auth.token";

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

/// Synchronous access to the current bearer token.
pub trait TokenSource: Send + Sync {
  fn token(&self) -> Option<String>;
}

impl<S: DurableStore> TokenSource for LocalStorage<S> {
  fn token(&self) -> Option<String> {
    self.get_item(AUTH_TOKEN_KEY).or_else(Config::env_api_token)
  }
}

/// REST backend client.
///
/// Every endpoint is an opaque `(method, path, params, body) -> JSON` call;
/// failures come back already classified as [`FetchError`]s.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  tokens: Arc<dyn TokenSource>,
  connectivity: Connectivity,
}

impl ApiClient {
  pub fn new(
    config: &ApiConfig,
    tokens: Arc<dyn TokenSource>,
    connectivity: Connectivity,
  ) -> Result<Self> {
    let mut base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL '{}': {}", config.base_url, e))?;
    // Url::join replaces the last segment unless the path ends with '/'
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(config.timeout())
      .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      tokens,
      connectivity,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| FetchError::Client {
        status: 0,
        message: format!("invalid request path '{}': {}", path, e),
      })
  }

  /// Perform one request. No retries happen here.
  pub async fn request(
    &self,
    method: Method,
    path: &str,
    params: &[(String, String)],
    body: Option<&Value>,
  ) -> Result<Value, FetchError> {
    if !self.connectivity.is_online() {
      return Err(FetchError::Offline);
    }

    let url = self.endpoint(path)?;
    debug!(%method, %url, "API request");

    let mut request = self.http.request(method.clone(), url);
    if !params.is_empty() {
      request = request.query(params);
    }
    if let Some(token) = self.tokens.token() {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| FetchError::transient(describe_send_error(&e)))?;

    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| FetchError::transient(format!("failed to read response body: {}", e)))?;

    if !status.is_success() {
      debug!(%method, path, status = status.as_u16(), "API request failed");
      return Err(FetchError::from_status(status.as_u16(), truncate(&text)));
    }

    if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
      return Ok(Value::Null);
    }

    serde_json::from_str(&text)
      .map_err(|e| FetchError::transient(format!("malformed response body: {}", e)))
  }

  pub async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Value, FetchError> {
    self.request(Method::GET, path, params, None).await
  }

  pub async fn post(&self, path: &str, body: &Value) -> Result<Value, FetchError> {
    self.request(Method::POST, path, &[], Some(body)).await
  }

  pub async fn put(&self, path: &str, body: &Value) -> Result<Value, FetchError> {
    self.request(Method::PUT, path, &[], Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> Result<Value, FetchError> {
    self.request(Method::DELETE, path, &[], None).await
  }
}

fn describe_send_error(e: &reqwest::Error) -> String {
  if e.is_timeout() {
    format!("request timed out: {}", e)
  } else if e.is_connect() {
    format!("connection failed: {}", e)
  } else {
    format!("request failed: {}", e)
  }
}

fn truncate(body: &str) -> String {
  match body.char_indices().nth(MAX_ERROR_BODY) {
    Some((idx, _)) => format!("{}...", &body[..idx]),
    None => body.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mockito::{Matcher, Server};
  use serde_json::json;

  struct StaticToken(Option<&'static str>);

  impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
      self.0.map(String::from)
    }
  }

  fn client(base_url: String, token: Option<&'static str>) -> ApiClient {
    let config = ApiConfig {
      base_url,
      timeout_ms: 5_000,
    };
    ApiClient::new(&config, Arc::new(StaticToken(token)), Connectivity::default()).unwrap()
  }

  #[tokio::test]
  async fn test_get_keeps_base_path_and_sends_token() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/v1/customers")
      .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
      .match_header("authorization", "Bearer secret")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"[{"id":"c1"}]"#)
      .create_async()
      .await;

    let api = client(format!("{}/v1", server.url()), Some("secret"));
    let body = api
      .get("/customers", &[("page".to_string(), "2".to_string())])
      .await
      .unwrap();

    assert_eq!(body, json!([{"id": "c1"}]));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_status_mapping() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/customers/missing")
      .with_status(404)
      .with_body("not found")
      .create_async()
      .await;
    server
      .mock("GET", "/customers/broken")
      .with_status(503)
      .with_body("maintenance")
      .create_async()
      .await;

    let api = client(server.url(), None);

    match api.get("customers/missing", &[]).await {
      Err(FetchError::Client { status, message }) => {
        assert_eq!(status, 404);
        assert_eq!(message, "not found");
      }
      other => panic!("expected client error, got {:?}", other),
    }

    match api.get("customers/broken", &[]).await {
      Err(FetchError::Transient(err)) => assert_eq!(err.status, Some(503)),
      other => panic!("expected transient error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_empty_body_is_null() {
    let mut server = Server::new_async().await;
    server
      .mock("DELETE", "/tasks/3")
      .with_status(204)
      .create_async()
      .await;

    let api = client(server.url(), None);
    assert_eq!(api.delete("tasks/3").await.unwrap(), Value::Null);
  }

  #[tokio::test]
  async fn test_put_sends_json_body() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("PUT", "/tasks/3")
      .match_body(Matcher::Json(json!({"status": "done"})))
      .with_status(200)
      .with_body(r#"{"id":3,"status":"done"}"#)
      .create_async()
      .await;

    let api = client(server.url(), None);
    let updated = api.put("tasks/3", &json!({"status": "done"})).await.unwrap();
    assert_eq!(updated["status"], "done");
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_offline_skips_network() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/sectors")
      .expect(0)
      .create_async()
      .await;

    let api = client(server.url(), None);
    api.connectivity.set_online(false);
    assert_eq!(api.get("sectors", &[]).await, Err(FetchError::Offline));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_connection_refused_is_transient() {
    // Nothing listens on port 9 (discard) in the test environment
    let api = client("http://127.0.0.1:9".to_string(), None);
    assert!(matches!(
      api.get("customers", &[]).await,
      Err(FetchError::Transient(_))
    ));
  }

  #[test]
  fn test_truncate_long_bodies() {
    let long = "x".repeat(MAX_ERROR_BODY + 10);
    let short = truncate(&long);
    assert_eq!(short.len(), MAX_ERROR_BODY + 3);
    assert_eq!(truncate("short"), "short");
  }
}
