//! ============================================================================
//! Core Types for AICOOK
//! ============================================================================
//! Chat messages exchanged with the text-generation service and the error
//! taxonomy shared by every component of the memory subsystem.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Role of a message in the conversation sent to the chat API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single chat message (OpenAI-compatible wire shape)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Errors from the chat / embedding HTTP layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("No API key configured for {0}")]
    MissingApiKey(&'static str),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse API response: {0}")]
    Decode(String),

    #[error("Empty response from API")]
    EmptyResponse,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// Memory subsystem errors.
///
/// Everything except `Config` is recoverable: callers degrade to "no memory"
/// and keep the conversational turn going.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("Fact extraction unavailable: {0}")]
    ExtractionUnavailable(String),

    #[error("Malformed extraction: {0}")]
    MalformedExtraction(String),

    #[error("Embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Fact store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Embedding mismatch: store uses {stored}, got {requested}")]
    EmbeddingMismatch { stored: String, requested: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    /// Whether the caller should degrade instead of failing
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MemoryError::Config(_))
    }
}
