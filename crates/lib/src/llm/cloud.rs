//! Cloud text-generation client.
//!
//! One POST of `{ "prompt": ... }` per completion; the endpoint answers
//! `{ "status": "success", "text": ... }`. Any non-2xx response or a
//! non-"success" status field is an error. Retry policy lives with the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787/generate";

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("cloud request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cloud api error: {0}")]
    Api(String),
}

/// The remote text-generation collaborator.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CloudError>;
}

/// HTTP client for the cloud endpoint.
#[derive(Clone)]
pub struct CloudClient {
    endpoint: String,
    client: reqwest::Client,
}

impl CloudClient {
    pub fn new(endpoint: Option<String>, request_timeout: Duration) -> Self {
        let endpoint = endpoint
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("cloud client builder failed ({}), using default client", e);
                reqwest::Client::new()
            });
        Self { endpoint, client }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl CloudBackend for CloudClient {
    async fn complete(&self, prompt: &str) -> Result<String, CloudError> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(&CompletionRequest { prompt })
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CloudError::Api(format!("{} {}", status, body)));
        }
        let data: CompletionResponse = res.json().await?;
        if data.status.as_deref() != Some("success") {
            return Err(CloudError::Api(format!(
                "endpoint returned status {}",
                data.status.as_deref().unwrap_or("(missing)")
            )));
        }
        data.text
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CloudError::Api("response missing text".to_string()))
    }
}
