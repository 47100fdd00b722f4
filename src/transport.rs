use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::report::OutboundRecord;

/// Longest response body excerpt kept for logging
const PREVIEW_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend returned HTTP {status}: {preview}")]
    Status { status: u16, preview: String },

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Conversation with the management backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit one record; `Ok` carries the 2xx status
    async fn post_record(&self, record: &OutboundRecord) -> Result<u16, TransportError>;

    /// Fetch a policy endpoint as JSON
    async fn get_json(&self, endpoint: &str) -> Result<serde_json::Value, TransportError>;
}

/// HTTPS transport authenticated with an API key header
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: String,
    devices_endpoint: String,
    post_timeout: Duration,
    fetch_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let url = url::Url::parse(&config.backend.url).context("Invalid backend URL")?;

        if url.scheme() != "https" {
            anyhow::bail!("Backend URL must use HTTPS for security (got: {})", url.scheme());
        }

        let client = Client::builder()
            .user_agent(format!("itam-agent/{}", env!("CARGO_PKG_VERSION")))
            .https_only(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: config.backend.url.trim_end_matches('/').to_string(),
            api_key: config.backend.api_key.clone(),
            devices_endpoint: config.backend.devices_endpoint.clone(),
            post_timeout: Duration::from_secs(config.backend.post_timeout),
            fetch_timeout: Duration::from_secs(config.backend.fetch_timeout),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_record(&self, record: &OutboundRecord) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(self.url(&self.devices_endpoint))
            .header("X-API-Key", &self.api_key)
            .timeout(self.post_timeout)
            .json(record)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(PREVIEW_LEN).collect();

        if status.is_success() {
            tracing::debug!("Backend accepted record: HTTP {} | {}", status.as_u16(), preview);
            Ok(status.as_u16())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                preview,
            })
        }
    }

    async fn get_json(&self, endpoint: &str) -> Result<serde_json::Value, TransportError> {
        let url = self.url(endpoint);
        tracing::debug!("Fetching policy from: {}", url);

        let response = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .timeout(self.fetch_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                preview: body.chars().take(PREVIEW_LEN).collect(),
            });
        }

        Ok(response.json().await?)
    }
}
