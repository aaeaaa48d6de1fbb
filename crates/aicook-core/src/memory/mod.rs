//! ============================================================================
//! Memory Module - Long-term preference memory for AICOOK
//! ============================================================================
//! Captures durable statements the user makes about themselves, stores them
//! as canonical facts with embeddings, and recalls the relevant ones before
//! each model call.
//!
//! ## Features
//! - Reduce utterances to canonical third-person facts
//! - Collapse paraphrases into one stored fact
//! - Semantic recall with a similarity threshold and a TTL cache
//! - Per-scope (per-user) isolation in one shared store
//!
//! ## Architecture
//! ```text
//! User Message → Recall (embed → search → threshold) → "Relevant memories"
//!                                                            ↓
//!                                     [System Prompt] + [Memories] + [Turn]
//!                                                            ↓
//!                                                      Chat Completion
//!
//! User Message → Extract (classify → reduce → embed) → Store (dedup → insert)
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use aicook_core::memory::MemoryManager;
//!
//! let manager = MemoryManager::from_config(&config, generator).await?;
//!
//! // Capture a preference
//! manager.observe("alice", "I like Python").await;
//!
//! // Recall for a new turn
//! let relevant = manager.recall("alice", "what language should I use?", 3).await;
//! ```
//! ============================================================================

pub mod canonical;
mod embeddings;
mod extractor;
mod manager;
mod qdrant;
mod recall;
mod similarity;
mod store;
mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export public types
pub use embeddings::{create_embedding_service, Embedder, EmbeddingService};
pub use extractor::{
    create_classifier, parse_classification, FactClassifier, FactExtractor, HeuristicClassifier,
    LlmClassifier, NO_FACT_SENTINEL,
};
pub use manager::{MemoryManager, FORGET_THRESHOLD, FORGET_TOP_N};
pub use qdrant::{QdrantFactStore, COLLECTION_NAME};
pub use recall::{format_memories_for_prompt, RecallCache, RecallEngine};
pub use similarity::cosine_similarity;
pub use store::{FactStore, RedbFactStore};
pub use types::{
    EmbeddingSpace, Extraction, Fact, FactId, FactQuery, ForgetReport, InsertOutcome,
    RememberOutcome, ScoredFact, StoreStats,
};
