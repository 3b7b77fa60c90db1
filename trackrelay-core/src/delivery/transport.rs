//! HTTP transport to the collector endpoint
//!
//! Every event is a single `POST {base_endpoint}/{tag}` with a JSON body.
//! Any 2xx status counts as delivered.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

use crate::config::RelayConfig;
use crate::error::{Error, Result};

/// Network seam for the delivery pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one event body to `endpoint_tag`. `Ok` only for a 2xx answer.
    async fn send(&self, endpoint_tag: &str, body: &Value) -> Result<()>;
}

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport from relay configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config.base_endpoint.trim().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            // Keep connections warm between bursts of events
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    /// Full URL for an endpoint tag
    pub fn endpoint_url(&self, endpoint_tag: &str) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(endpoint_tag))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint_tag: &str, body: &Value) -> Result<()> {
        let url = self.endpoint_url(endpoint_tag);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            tracing::trace!(url = %url, status = status.as_u16(), "Event delivered");
            Ok(())
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}
