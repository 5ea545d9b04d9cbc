//! HTTP provider: POSTs the opaque payload to a configured endpoint

use async_trait::async_trait;
use reqwest::{Client, header};
use serde_json::Value;
use tracing::{debug, warn};

use super::{GenerationRequest, Provider, ProviderId, ProviderResponse};
use crate::config::ProviderConfig;
use crate::{Error, Result};

/// Longest response body excerpt carried in a provider error
const ERROR_BODY_LIMIT: usize = 512;

/// Provider reached over HTTP
pub struct HttpProvider {
    id: ProviderId,
    endpoint: String,
    client: Client,
}

impl HttpProvider {
    /// Build a provider from its configuration
    pub fn new(id: ProviderId, config: &ProviderConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(Error::Config(format!("Provider {id} has no endpoint")));
        }

        let mut headers = header::HeaderMap::new();
        for (name, value) in &config.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("Provider {id}: invalid header {name}: {e}")))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Provider {id}: invalid value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            id,
            endpoint: config.endpoint.clone(),
            client,
        })
    }

    /// Configured endpoint
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Human-readable transport failure
    fn describe_failure(&self, err: &reqwest::Error) -> String {
        if err.is_timeout() {
            format!("request to {} timed out", self.endpoint)
        } else if err.is_connect() {
            format!("could not connect to {}", self.endpoint)
        } else {
            err.to_string()
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ProviderResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Request-Id", &request.id)
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| Error::Provider {
                provider: self.id.clone(),
                status: e.status().map(|s| s.as_u16()),
                message: self.describe_failure(&e),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| Error::Provider {
            provider: self.id.clone(),
            status: Some(status.as_u16()),
            message: self.describe_failure(&e),
        })?;

        if !status.is_success() {
            warn!(
                provider = %self.id,
                status = status.as_u16(),
                "Provider returned error status"
            );
            return Err(Error::Provider {
                provider: self.id.clone(),
                status: Some(status.as_u16()),
                message: truncate(&text, ERROR_BODY_LIMIT),
            });
        }

        // Non-JSON bodies are passed through as a string
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        debug!(
            provider = %self.id,
            status = status.as_u16(),
            "Provider returned success status"
        );

        Ok(ProviderResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
