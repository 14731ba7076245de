//! Vision-language model engine.
//!
//! [`VisionEngine`] is the seam between the HTTP layer and whatever runs the
//! model. The shipped implementation, [`OpenAiCompatEngine`], forwards each
//! request to an OpenAI-compatible chat-completions server (vLLM, for
//! instance) with the image inlined as a `data:` URL.
//!
//! The engine lives in an [`EngineSlot`]: empty while the backend is still
//! loading, filled by [`spawn_loader`] once the backend answers its readiness
//! probe. Handlers read the slot; nothing else mutates it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;

/// Errors surfaced by an engine while processing a request.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model backend returned HTTP {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("model backend returned no completion")]
    EmptyCompletion,
}

/// Anything that can answer a natural-language query about an image.
#[async_trait]
pub trait VisionEngine: Send + Sync {
    /// Model identifier reported by `/health`.
    fn model_name(&self) -> &str;

    /// Run one query against one image. `mime` is the detected image type.
    async fn analyze(&self, image: &[u8], mime: &str, query: &str) -> Result<String, EngineError>;
}

/// Shared, late-initialised engine handle.
pub type EngineSlot = Arc<RwLock<Option<Arc<dyn VisionEngine>>>>;

/// Create an empty slot.
pub fn empty_slot() -> EngineSlot {
    Arc::new(RwLock::new(None))
}

/// Engine backed by an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiCompatEngine {
    http: reqwest::Client,
    base_url: String,
    config: ModelConfig,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatEngine {
    pub fn new(base_url: &str, config: ModelConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    /// `GET /v1/models` — true once the backend is serving.
    pub async fn probe(&self) -> bool {
        match self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Model backend not ready: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl VisionEngine for OpenAiCompatEngine {
    fn model_name(&self) -> &str {
        &self.config.name
    }

    async fn analyze(&self, image: &[u8], mime: &str, query: &str) -> Result<String, EngineError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let body = json!({
            "model": self.config.name,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": format!("data:{mime};base64,{encoded}")}},
                    {"type": "text", "text": query},
                ],
            }],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "top_p": self.config.top_p,
        });

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EngineError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletion = resp.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or(EngineError::EmptyCompletion)
    }
}

/// Spawn the background loader: probe the backend until it answers, then
/// install the engine into `slot`. Returns `None` when no endpoint is
/// configured (the slot stays empty and `/analyze` answers 503).
pub fn spawn_loader(config: &ModelConfig, slot: EngineSlot) -> Option<tokio::task::JoinHandle<()>> {
    let Some(endpoint) = config.endpoint.clone() else {
        warn!("No model endpoint configured — /analyze will answer 503");
        return None;
    };
    let config = config.clone();
    Some(tokio::spawn(async move {
        let engine = match OpenAiCompatEngine::new(&endpoint, config.clone()) {
            Ok(engine) => engine,
            Err(e) => {
                warn!("Failed to build model client: {e}");
                return;
            }
        };
        info!("Loading model {} via {endpoint}", config.name);
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.probe_interval_secs.max(1)));
        loop {
            interval.tick().await;
            if engine.probe().await {
                break;
            }
        }
        info!("Model {} ready", config.name);
        *slot.write().await = Some(Arc::new(engine));
    }))
}

/// Sniff the image type from its magic bytes. Unknown formats are sent as
/// JPEG, which is what the gateway uploads.
pub fn detect_mime(image: &[u8]) -> &'static str {
    match image {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}
