//! ============================================================================
//! Chat Client - Text generation via an OpenAI-compatible API
//! ============================================================================
//! Used for the assistant's replies and for fact classification. Defaults to
//! Gemini's OpenAI-compatible endpoint; any compatible base URL works.
//! ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::MemoryConfig;
use crate::types::{ChatMessage, LlmError};

/// Sampling options for one generation call
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Anything that turns a conversation into a reply
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<String, LlmError>;
}

/// HTTP chat completions client
pub struct ChatClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(api_key: Option<String>, base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            config.api_key.clone(),
            config.api_base.clone(),
            config.model.clone(),
            config.request_timeout(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl TextGenerator for ChatClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> Result<String, LlmError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey("chat completions"))?;

        debug!(
            "Calling chat API ({}) with {} messages",
            self.model,
            messages.len()
        );

        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
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

        let chat_response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::Decode(e.to_string()))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else {
        LlmError::Transport(e.to_string())
    }
}

/// Build an `Api` error, preferring the provider's own error message
pub(crate) fn api_error(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.into_message())
        .unwrap_or_else(|_| body.to_string());
    LlmError::Api { status, message }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Gemini's compatibility layer sometimes wraps errors in a list
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorEnvelope {
    Single { error: ErrorDetail },
    List(Vec<ErrorEnvelopeItem>),
}

#[derive(Deserialize)]
struct ErrorEnvelopeItem {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorEnvelope {
    fn into_message(self) -> String {
        match self {
            ErrorEnvelope::Single { error } => error.message,
            ErrorEnvelope::List(items) => items
                .into_iter()
                .map(|i| i.error.message)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}
