use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::config::NetworkConfig;

use super::types::{InterceptedRequest, Response};

/// Network access behind the interception layer.
///
/// An `Err` means the request never produced a response (DNS, connection,
/// timeout). Any HTTP status, including 4xx/5xx, is an `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &InterceptedRequest) -> Result<Response>;
}

/// reqwest-backed network client
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(config.user_agent.clone())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpClient {
  async fn fetch(&self, request: &InterceptedRequest) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let response = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let url = response.url().to_string();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
      url,
    })
  }
}

/// A network that is always down. Used by `fetch --offline`.
pub struct OfflineNetwork;

#[async_trait]
impl Network for OfflineNetwork {
  async fn fetch(&self, request: &InterceptedRequest) -> Result<Response> {
    Err(eyre!("Network unavailable: {}", request.url))
  }
}
