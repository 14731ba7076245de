//! Local fallback model, used when the remote path is exhausted.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::config::FallbackConfig;

/// Prefix of the string returned in place of an error when the local model
/// fails, so batch callers can keep going.
pub const FALLBACK_ERROR_TAG: &str = "LOCAL_FALLBACK_ERROR";

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("local model unreachable at {base_url}: {source}")]
    Unreachable {
        base_url: String,
        source: reqwest::Error,
    },
    #[error("local model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("local model returned HTTP {status}: {message}")]
    Model { status: u16, message: String },
    #[error("local model timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait LocalModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, image: &[u8], query: &str) -> Result<String, FallbackError>;
}

/// Vision model served by a local Ollama instance.
pub struct OllamaFallback {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct OllamaError {
    error: String,
}

impl OllamaFallback {
    pub fn new(config: &FallbackConfig) -> Result<Self, FallbackError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl LocalModel for OllamaFallback {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, image: &[u8], query: &str) -> Result<String, FallbackError> {
        debug!(model = %self.model, prompt_len = query.len(), "Running local fallback");
        let body = GenerateRequest {
            model: &self.model,
            prompt: query,
            images: vec![base64::engine::general_purpose::STANDARD.encode(image)],
            stream: false,
        };

        let resp = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    error!(base_url = %self.base_url, "Ollama not reachable, start it with 'ollama serve'");
                    FallbackError::Unreachable {
                        base_url: self.base_url.clone(),
                        source: e,
                    }
                } else {
                    FallbackError::Request(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OllamaError>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(FallbackError::Model {
                status: status.as_u16(),
                message,
            });
        }

        let generated: GenerateResponse = resp.json().await?;
        Ok(generated.response)
    }
}
