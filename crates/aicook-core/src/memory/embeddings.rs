//! ============================================================================
//! Embedding Service - Vector embeddings for semantic fact search
//! ============================================================================
//! Generates text embeddings through an OpenAI-compatible `/embeddings`
//! endpoint. The same model must be used for the whole lifetime of a store.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::llm::{api_error, transport_error};
use crate::types::{LlmError, MemoryError};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Used when falling back to OpenAI with the default Gemini model configured
const OPENAI_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Text-to-vector conversion
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed several texts; one vector per input, in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, LlmError>;

    /// Identifier of the embedding model, pinned by the store
    fn model(&self) -> &str;

    async fn embed_single(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.embed(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(LlmError::EmptyResponse)
    }
}

/// Embedding service for generating text vectors over HTTP
pub struct EmbeddingService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    total_tokens: u32,
}

impl EmbeddingService {
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Embedder for EmbeddingService {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let request = EmbeddingRequest {
            model: &self.model,
            input: &texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        let embedding_response: EmbeddingResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Decode(e.to_string()))?;

        if let Some(usage) = &embedding_response.usage {
            debug!(
                "Embedding tokens used: {} (model: {})",
                usage.total_tokens, self.model
            );
        }

        if embedding_response.data.len() != texts.len() {
            return Err(LlmError::Decode(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embedding_response.data.len()
            )));
        }

        // Sort by index and extract embeddings
        let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        Ok(embeddings.into_iter().map(|(_, e)| e).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Create the embedding service from config.
///
/// The key resolution order is `EMBEDDING_API_KEY`, `GEMINI_API_KEY`, then
/// `OPENAI_API_KEY`; an OpenAI key with the default base switches to OpenAI.
pub fn create_embedding_service(config: &MemoryConfig) -> Result<EmbeddingService, MemoryError> {
    let key = config
        .embedding_api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            MemoryError::Config(
                "No embedding API key available (tried EMBEDDING_API_KEY, GEMINI_API_KEY, OPENAI_API_KEY)"
                    .into(),
            )
        })?;

    let mut base_url = config.embedding_api_base.clone();
    let mut model = config.embedding_model.clone();
    if config.api_key.is_none() && base_url == crate::config::DEFAULT_API_BASE {
        warn!("Gemini API key not available, falling back to OpenAI for embeddings");
        base_url = OPENAI_API_BASE.to_string();
        if model == crate::config::DEFAULT_EMBEDDING_MODEL {
            model = OPENAI_EMBEDDING_MODEL.to_string();
        }
    }

    Ok(EmbeddingService::new(
        key,
        base_url,
        model,
        config.request_timeout(),
    ))
}
