//! ============================================================================
//! Configuration - Environment-driven settings for AICOOK
//! ============================================================================
//! Every option comes from the environment (optionally seeded by a `.env`
//! file). API keys are only ever read from the environment and are never
//! serialized.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::MemoryError;

/// Gemini's OpenAI-compatible endpoint
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";
pub const DEFAULT_SCOPE: &str = "default";

/// How utterances are classified into facts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Fixed instruction template sent to the chat model
    #[default]
    Llm,
    /// Local sentence patterns, no network call
    Heuristic,
}

impl FromStr for ClassifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(ClassifierKind::Llm),
            "heuristic" => Ok(ClassifierKind::Heuristic),
            other => Err(format!("expected llm or heuristic, got {}", other)),
        }
    }
}

/// Runtime configuration for the assistant and its memory subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub model: String,
    pub api_base: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub enable_memory: bool,
    pub classifier: ClassifierKind,
    pub embedding_model: String,
    pub embedding_api_base: String,
    #[serde(skip)]
    pub embedding_api_key: Option<String>,
    /// Embedded store file; `None` means `~/.aicook/memory.redb`
    pub store_path: Option<PathBuf>,
    /// When set, facts live in Qdrant instead of the embedded store
    pub qdrant_url: Option<String>,
    pub similarity_threshold: f32,
    pub dedup_threshold: f32,
    pub default_k: usize,
    pub request_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_size: usize,
    pub scope: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_CHAT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 2048,
            enable_memory: true,
            classifier: ClassifierKind::Llm,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_api_base: DEFAULT_API_BASE.to_string(),
            embedding_api_key: None,
            store_path: None,
            qdrant_url: None,
            similarity_threshold: 0.45,
            dedup_threshold: 0.85,
            default_k: 3,
            request_timeout_secs: 10,
            cache_ttl_secs: 60,
            cache_size: 256,
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

impl MemoryConfig {
    /// Load `.env` (if present) and build the config from the environment
    pub fn from_env() -> Result<Self, MemoryError> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MemoryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = get("GEMINI_API_KEY");
        if api_key.is_none() {
            warn!("GEMINI_API_KEY not set; chat and extraction calls will fail until it is provided");
        }

        let api_base = get("AICOOK_API_BASE").unwrap_or(defaults.api_base);
        let embedding_api_key = get("EMBEDDING_API_KEY")
            .or_else(|| api_key.clone())
            .or_else(|| get("OPENAI_API_KEY"));

        let config = Self {
            model: get("GEMINI_MODEL")
                .map(|m| resolve_model_alias(&m))
                .unwrap_or(defaults.model),
            embedding_api_base: get("EMBEDDING_API_BASE").unwrap_or_else(|| api_base.clone()),
            api_base,
            api_key,
            temperature: parse_var(&get, "TEMPERATURE", defaults.temperature)?,
            max_tokens: parse_var(&get, "MAX_TOKENS", defaults.max_tokens)?,
            enable_memory: match get("ENABLE_MEMORY") {
                Some(v) => parse_bool("ENABLE_MEMORY", &v)?,
                None => defaults.enable_memory,
            },
            classifier: parse_var(&get, "FACT_CLASSIFIER", defaults.classifier)?,
            embedding_model: get("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_api_key,
            store_path: get("MEMORY_DB_PATH").map(PathBuf::from),
            qdrant_url: get("QDRANT_URL"),
            similarity_threshold: parse_var(
                &get,
                "MEMORY_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            )?,
            dedup_threshold: parse_var(&get, "MEMORY_DEDUP_THRESHOLD", defaults.dedup_threshold)?,
            default_k: parse_var(&get, "MEMORY_TOP_K", defaults.default_k)?,
            request_timeout_secs: parse_var(
                &get,
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            cache_ttl_secs: parse_var(&get, "RECALL_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            cache_size: parse_var(&get, "RECALL_CACHE_SIZE", defaults.cache_size)?,
            scope: get("AICOOK_USER").unwrap_or(defaults.scope),
        };

        config.validate()?;
        Ok(config)
    }

    /// Range-check the tunables
    pub fn validate(&self) -> Result<(), MemoryError> {
        for (name, value) in [
            ("MEMORY_SIMILARITY_THRESHOLD", self.similarity_threshold),
            ("MEMORY_DEDUP_THRESHOLD", self.dedup_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::Config(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        if self.default_k == 0 {
            return Err(MemoryError::Config("MEMORY_TOP_K must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(MemoryError::Config(
                "REQUEST_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        if self.scope.trim().is_empty() {
            return Err(MemoryError::Config("AICOOK_USER must not be empty".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Resolve the embedded store path, creating its parent directory
    pub fn resolve_store_path(&self) -> Result<PathBuf, MemoryError> {
        let path = match &self.store_path {
            Some(p) => p.clone(),
            None => {
                let home = dirs::home_dir().ok_or_else(|| {
                    MemoryError::Config("Cannot determine home directory".into())
                })?;
                home.join(".aicook").join("memory.redb")
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemoryError::StoreUnavailable(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        Ok(path)
    }
}

/// Map the short model aliases to concrete model ids
pub fn resolve_model_alias(choice: &str) -> String {
    match choice.trim().to_lowercase().as_str() {
        "2.5-pro" => "gemini-2.5-pro".to_string(),
        "2.5-flash" => "gemini-2.5-flash".to_string(),
        _ => choice.trim().to_string(),
    }
}

fn parse_var<G, T>(get: &G, key: &str, default: T) -> Result<T, MemoryError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MemoryError::Config(format!("Invalid {} '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, MemoryError> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(MemoryError::Config(format!(
            "Invalid {} '{}': expected true or false",
            key, raw
        ))),
    }
}
