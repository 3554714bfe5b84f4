//! Ollama-served local engine provider (http://127.0.0.1:11434 by default).
//!
//! `load` pulls the model through `/api/pull` (streaming NDJSON progress, a
//! cheap no-op when already cached), warms it into memory, and yields an
//! engine whose completions go through `/api/generate`.

use crate::engine::{Engine, EngineError, EngineProvider, GenOptions, LoadEvent, LoadStream, ProgressReport};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Engine provider backed by a local Ollama daemon.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EngineProvider for OllamaProvider {
    /// GET /api/version — feature detection for the daemon.
    async fn available(&self) -> bool {
        let url = format!("{}/api/version", self.base_url);
        match self.client.get(&url).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                log::debug!("ollama probe failed: {}", e);
                false
            }
        }
    }

    fn load(&self, model_id: &str) -> LoadStream {
        let this = self.clone();
        let model = model_id.to_string();
        Box::pin(async_stream::stream! {
            let url = format!("{}/api/pull", this.base_url);
            let body = PullRequest {
                model: model.clone(),
                stream: true,
            };
            let res = match this.client.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    yield LoadEvent::Failed(EngineError::Load(e.to_string()));
                    return;
                }
            };
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                yield LoadEvent::Failed(EngineError::Load(format!("{} {}", status, body)));
                return;
            }

            // NDJSON lines: {"status":"pulling manifest"}, {"status":"...","completed":n,"total":n},
            // terminated by {"status":"success"}; errors arrive as {"error":"..."}.
            let mut stream = res.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            'pull: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield LoadEvent::Failed(EngineError::Load(e.to_string()));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(..i).collect();
                    buffer.drain(..1);
                    let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let event: PullEvent = match serde_json::from_str(&line) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };
                    if let Some(err) = event.error {
                        yield LoadEvent::Failed(EngineError::Load(err));
                        return;
                    }
                    let progress = match (event.completed, event.total) {
                        (Some(c), Some(t)) if t > 0 => Some((c as f32 / t as f32).clamp(0.0, 1.0)),
                        _ => None,
                    };
                    let status = event.status.unwrap_or_default();
                    if status == "success" {
                        break 'pull;
                    }
                    if !status.is_empty() {
                        yield LoadEvent::Progress(ProgressReport { text: status, progress });
                    }
                }
            }

            yield LoadEvent::Progress(ProgressReport {
                text: "loading model into memory".to_string(),
                progress: None,
            });
            let engine = OllamaEngine {
                base_url: this.base_url.clone(),
                client: this.client.clone(),
                model,
            };
            match engine.warm_up().await {
                Ok(()) => {
                    yield LoadEvent::Progress(ProgressReport {
                        text: "ready".to_string(),
                        progress: Some(1.0),
                    });
                    yield LoadEvent::Ready(Arc::new(engine));
                }
                Err(e) => yield LoadEvent::Failed(e),
            }
        })
    }
}

/// A model loaded in the Ollama daemon.
struct OllamaEngine {
    base_url: String,
    client: reqwest::Client,
    model: String,
}

impl OllamaEngine {
    /// POST /api/generate with an empty prompt loads the weights into memory.
    async fn warm_up(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt: "",
            stream: false,
            options: None,
        };
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Load(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::Load(format!("{} {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl Engine for OllamaEngine {
    async fn generate(&self, prompt: &str, options: &GenOptions) -> Result<String, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: Some(GenerateRequestOptions {
                num_predict: options.max_length,
                temperature: options.temperature,
                top_p: options.top_p,
            }),
        };
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Generate(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(EngineError::Generate(format!("{} {}", status, body)));
        }
        let data: GenerateResponse = res
            .json()
            .await
            .map_err(|e| EngineError::Generate(e.to_string()))?;
        Ok(data.response.unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct PullRequest {
    model: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullEvent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateRequestOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateRequestOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}
