//! Injectable JSON fetchers.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::FetchError;

/// Something that can GET a URL and return its JSON body.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch_json(&self, url: &str) -> Result<Value, FetchError>;
}

/// [`Fetcher`] over a real HTTP client.
///
/// Any non-2xx status is a [`FetchError::Status`]; a body that is not JSON is
/// a [`FetchError::Decode`]. Timeouts are the HTTP client's.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Option<Duration>) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch_json(&self, url: &str) -> Result<Value, FetchError> {
    debug!("GET {}", url);
    let response = self.client.get(url).send().await?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status {
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("").to_string(),
      });
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| FetchError::Decode(e.to_string()))
  }
}
