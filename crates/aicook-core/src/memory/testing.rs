//! Test doubles for the classifier, embedder, generator and store ports,
//! including slow variants for timeout paths.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::embeddings::Embedder;
use super::extractor::FactClassifier;
use super::store::FactStore;
use super::types::{EmbeddingSpace, Fact, FactId, InsertOutcome, ScoredFact, StoreStats};
use crate::llm::{GenerationOptions, TextGenerator};
use crate::types::{ChatMessage, LlmError, MemoryError};

/// Keyword-topic embedder: one dimension per topic plus a small bias
/// dimension, so related sentences land close together deterministically.
pub struct KeywordEmbedder {
    model: String,
    calls: AtomicUsize,
}

const TOPICS: &[&[&str]] = &[
    &["python", "rust", "language", "languages", "script", "code", "programming", "typescript"],
    &["seafood", "fish", "shrimp", "food", "eat", "dinner", "cook", "cooking", "meal"],
    &["name", "alice", "bob", "called"],
    &["music", "jazz", "song", "songs", "band"],
    &["tea", "coffee", "drink"],
    &["editor", "neovim", "helix", "vim"],
];

impl KeywordEmbedder {
    pub const MODEL: &'static str = "keyword-test";

    pub fn new() -> Self {
        Self::with_model(Self::MODEL)
    }

    pub fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut vector: Vec<f32> = TOPICS
            .iter()
            .map(|keywords| tokens.iter().filter(|t| keywords.contains(t)).count() as f32)
            .collect();
        vector.push(0.05);
        vector
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Embedder that answers only after the given delay
pub struct SlowEmbedder(pub Duration);

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, LlmError> {
        tokio::time::sleep(self.0).await;
        Ok(texts.iter().map(|t| KeywordEmbedder::vector(t)).collect())
    }

    fn model(&self) -> &str {
        KeywordEmbedder::MODEL
    }
}

/// Classifier that hands the utterance back unchanged
pub struct EchoClassifier;

#[async_trait]
impl FactClassifier for EchoClassifier {
    async fn classify(&self, utterance: &str) -> Result<Option<String>, MemoryError> {
        Ok(Some(utterance.to_string()))
    }
}

/// Classifier that never answers within any reasonable timeout
pub struct SlowClassifier(pub Duration);

#[async_trait]
impl FactClassifier for SlowClassifier {
    async fn classify(&self, _utterance: &str) -> Result<Option<String>, MemoryError> {
        tokio::time::sleep(self.0).await;
        Ok(None)
    }
}

/// Generator that replays canned replies and records every request
pub struct ScriptedGenerator {
    replies: Mutex<Vec<String>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
        let mut replies: Vec<String> = replies.into_iter().map(String::from).collect();
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        _options: GenerationOptions,
    ) -> Result<String, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop()
            .ok_or(LlmError::EmptyResponse)
    }
}

/// Generator whose service is unreachable
pub struct FailingGenerator;

#[async_trait]
impl TextGenerator for FailingGenerator {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _options: GenerationOptions,
    ) -> Result<String, LlmError> {
        Err(LlmError::Transport("connection refused".into()))
    }
}

/// Store whose backend cannot be reached
pub struct UnavailableStore;

fn down() -> MemoryError {
    MemoryError::StoreUnavailable("backend unreachable".into())
}

#[async_trait]
impl FactStore for UnavailableStore {
    async fn insert(&self, _fact: Fact) -> Result<InsertOutcome, MemoryError> {
        Err(down())
    }

    async fn search(
        &self,
        _scope: &str,
        _embedding: &[f32],
        _k: usize,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        Err(down())
    }

    fn all<'a>(&'a self, _scope: &'a str) -> BoxStream<'a, Result<Fact, MemoryError>> {
        Box::pin(stream::once(async { Err(down()) }))
    }

    async fn get(&self, _id: &FactId) -> Result<Option<Fact>, MemoryError> {
        Err(down())
    }

    async fn delete(&self, _scope: &str, _ids: &[FactId]) -> Result<usize, MemoryError> {
        Err(down())
    }

    async fn clear(&self, _scope: &str) -> Result<usize, MemoryError> {
        Err(down())
    }

    async fn count(&self, _scope: &str) -> Result<usize, MemoryError> {
        Err(down())
    }

    async fn stats(&self) -> Result<StoreStats, MemoryError> {
        Err(down())
    }

    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        Ok(None)
    }

    async fn health_check(&self) -> bool {
        false
    }
}

/// Store that hangs for the given delay on every data call
pub struct SlowStore(pub Duration);

impl SlowStore {
    async fn stall(&self) {
        tokio::time::sleep(self.0).await;
    }
}

#[async_trait]
impl FactStore for SlowStore {
    async fn insert(&self, fact: Fact) -> Result<InsertOutcome, MemoryError> {
        self.stall().await;
        Ok(InsertOutcome::Inserted(fact.id))
    }

    async fn search(
        &self,
        _scope: &str,
        _embedding: &[f32],
        _k: usize,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        self.stall().await;
        Ok(vec![])
    }

    fn all<'a>(&'a self, _scope: &'a str) -> BoxStream<'a, Result<Fact, MemoryError>> {
        Box::pin(stream::empty())
    }

    async fn get(&self, _id: &FactId) -> Result<Option<Fact>, MemoryError> {
        self.stall().await;
        Ok(None)
    }

    async fn delete(&self, _scope: &str, _ids: &[FactId]) -> Result<usize, MemoryError> {
        self.stall().await;
        Ok(0)
    }

    async fn clear(&self, _scope: &str) -> Result<usize, MemoryError> {
        self.stall().await;
        Ok(0)
    }

    async fn count(&self, _scope: &str) -> Result<usize, MemoryError> {
        self.stall().await;
        Ok(0)
    }

    async fn stats(&self) -> Result<StoreStats, MemoryError> {
        self.stall().await;
        Err(down())
    }

    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        Ok(None)
    }

    async fn health_check(&self) -> bool {
        self.stall().await;
        true
    }
}
