//! HTTP client for an Ollama-compatible `/api/generate` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use tabula_core::config::{GenerationOptions, UpstreamConfig};

use super::{ByteStream, Upstream, UpstreamError};

/// Longest error body kept from a failed response.
const MAX_ERROR_BODY: usize = 512;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Body of a generate request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerationOptions,
}

/// Streaming client for the inference service.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    options: GenerationOptions,
}

impl OllamaClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| UpstreamError::Connect(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            options: config.options.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the streaming request body for a prompt.
    pub fn request(&self, prompt: String) -> GenerateRequest {
        GenerateRequest {
            model: self.model.clone(),
            prompt,
            stream: true,
            options: self.options.clone(),
        }
    }
}

#[async_trait]
impl Upstream for OllamaClient {
    async fn open(&self, prompt: String) -> Result<ByteStream, UpstreamError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = self.request(prompt);
        debug!(url = %url, model = %body.model, prompt_len = body.prompt.len(), "Opening upstream stream");

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let body: String = text.chars().take(MAX_ERROR_BODY).collect();
            warn!(status = status.as_u16(), body = %body, "Upstream rejected generate request");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(
            resp.bytes_stream()
                .map_err(|e| UpstreamError::Transport(e.to_string())),
        ))
    }

    async fn health(&self) -> Result<(), UpstreamError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Status {
                status: resp.status().as_u16(),
                body: String::new(),
            })
        }
    }
}
