//! Remote fallback for history items that cannot be kept locally.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::item::HistoryItem;
use crate::error::FetchError;

/// Where history payloads go when local storage is full.
#[async_trait]
pub trait RemoteSink: Send + Sync {
  /// Store the full item remotely and return the remote identifier.
  async fn upload(&self, item: &HistoryItem) -> Result<String, FetchError>;
}

/// Sink used when no remote endpoint is configured.
/// Every upload fails, so a full local store surfaces as an error.
pub struct DisabledSink;

#[async_trait]
impl RemoteSink for DisabledSink {
  async fn upload(&self, _item: &HistoryItem) -> Result<String, FetchError> {
    Err(FetchError::Other("no remote history sink configured".to_string()))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Endpoint accepting a POSTed history item
  pub url: Option<String>,
  pub max_retries: u32,
  /// Base delay; attempt `n` waits `retry_delay_ms * (n + 1)`
  pub retry_delay_ms: u64,
  pub timeout_ms: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: None,
      max_retries: 2,
      retry_delay_ms: 1000,
      timeout_ms: 30_000,
    }
  }
}

/// [`RemoteSink`] that POSTs the item as JSON.
///
/// Retries transport failures and 5xx responses with linear backoff. A 429
/// is returned immediately.
pub struct HttpRemoteSink {
  client: reqwest::Client,
  endpoint: Url,
  max_retries: u32,
  retry_delay: Duration,
}

#[derive(Deserialize)]
struct UploadResponse {
  id: Value,
}

#[derive(Deserialize)]
struct ErrorResponse {
  error: String,
}

impl HttpRemoteSink {
  pub fn new(endpoint: &str, config: &RemoteConfig) -> Result<Self> {
    let endpoint =
      Url::parse(endpoint).map_err(|e| eyre!("Invalid remote sink URL {}: {}", endpoint, e))?;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      endpoint,
      max_retries: config.max_retries,
      retry_delay: Duration::from_millis(config.retry_delay_ms),
    })
  }

  async fn backoff(&self, attempt: u32) {
    tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
  }

  async fn post_once(&self, item: &HistoryItem) -> Result<String, FetchError> {
    let response = self
      .client
      .post(self.endpoint.clone())
      .json(item)
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let reason = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("").to_string(),
      };
      return Err(FetchError::Status {
        status: status.as_u16(),
        reason,
      });
    }

    let body: UploadResponse = response
      .json()
      .await
      .map_err(|e| FetchError::Decode(e.to_string()))?;
    match body.id {
      Value::String(id) => Ok(id),
      Value::Number(n) => Ok(n.to_string()),
      other => Err(FetchError::Decode(format!("unexpected id {}", other))),
    }
  }
}

#[async_trait]
impl RemoteSink for HttpRemoteSink {
  async fn upload(&self, item: &HistoryItem) -> Result<String, FetchError> {
    let mut attempt = 0;
    loop {
      match self.post_once(item).await {
        Ok(id) => {
          info!("Saved history item {} remotely as {}", item.id, id);
          return Ok(id);
        }
        Err(e) if e.is_retryable() && attempt < self.max_retries => {
          warn!("Remote save of {} failed ({}), retrying", item.id, e);
          self.backoff(attempt).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::history::HistoryStatus;
  use chrono::Utc;
  use serde_json::json;
  use wiremock::matchers::{body_partial_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn item() -> HistoryItem {
    HistoryItem::new(
      "item-1",
      "plan",
      "Spring",
      json!({"k": "v"}),
      HistoryStatus::Draft,
      Utc::now(),
    )
  }

  fn fast_retries() -> RemoteConfig {
    RemoteConfig {
      retry_delay_ms: 1,
      ..RemoteConfig::default()
    }
  }

  #[tokio::test]
  async fn test_upload_posts_item() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/history"))
      .and(body_partial_json(json!({"id": "item-1", "type": "plan"})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 99})))
      .expect(1)
      .mount(&server)
      .await;

    let sink = HttpRemoteSink::new(&format!("{}/api/history", server.uri()), &fast_retries()).unwrap();
    assert_eq!(sink.upload(&item()).await.unwrap(), "99");
  }

  #[tokio::test]
  async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .up_to_n_times(2)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "srv-1"})))
      .mount(&server)
      .await;

    let sink = HttpRemoteSink::new(&server.uri(), &fast_retries()).unwrap();
    assert_eq!(sink.upload(&item()).await.unwrap(), "srv-1");
  }

  #[tokio::test]
  async fn test_rate_limit_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(429).set_body_json(json!({"error": "slow down"})))
      .expect(1)
      .mount(&server)
      .await;

    let sink = HttpRemoteSink::new(&server.uri(), &fast_retries()).unwrap();
    let err = sink.upload(&item()).await.unwrap_err();
    assert_eq!(
      err,
      FetchError::Status {
        status: 429,
        reason: "slow down".into()
      }
    );
  }

  #[tokio::test]
  async fn test_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(500))
      .expect(3)
      .mount(&server)
      .await;

    let sink = HttpRemoteSink::new(&server.uri(), &fast_retries()).unwrap();
    let err = sink.upload(&item()).await.unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 500, .. }));
  }

  #[tokio::test]
  async fn test_disabled_sink_fails() {
    assert!(DisabledSink.upload(&item()).await.is_err());
  }
}
