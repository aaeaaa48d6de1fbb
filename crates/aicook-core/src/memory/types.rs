//! ============================================================================
//! Memory Types - Facts, queries and outcomes
//! ============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::MemoryError;

pub type FactId = Uuid;

/// A canonical, third-person statement about the user.
///
/// Facts are never mutated after insert. A refinement or contradiction is a
/// new fact; the older one stays until `forget` removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    /// User / session partition the fact belongs to
    pub scope: String,
    /// Normalized sentence, e.g. "User prefers Python language"
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    /// Model that produced `embedding`
    pub embedding_model: String,
    /// Unix milliseconds, non-decreasing across inserts into one store
    pub created_at: i64,
    /// Store-assigned insertion counter, tie-breaker for equal timestamps
    pub sequence: u64,
    /// Raw user text the fact was reduced from
    pub source_utterance: String,
}

impl Fact {
    pub fn new(
        scope: impl Into<String>,
        text: impl Into<String>,
        source_utterance: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: scope.into(),
            text: text.into(),
            embedding: Vec::new(),
            embedding_model: String::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            sequence: 0,
            source_utterance: source_utterance.into(),
        }
    }

    /// Attach the embedding and the model that produced it
    pub fn with_embedding(mut self, embedding: Vec<f32>, model: impl Into<String>) -> Self {
        self.embedding = embedding;
        self.embedding_model = model.into();
        self
    }

    /// `created_at` formatted as a calendar date
    pub fn created_date(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.created_at)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown date".to_string())
    }
}

/// A fact paired with its similarity to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f32,
}

/// Ephemeral recall request
#[derive(Debug, Clone)]
pub struct FactQuery {
    pub text: String,
    pub k: usize,
    /// Overrides the engine's similarity threshold
    pub threshold: Option<f32>,
}

impl FactQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// The embedding model + dimension a store is pinned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub model: String,
    pub dimension: usize,
}

impl std::fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} dims)", self.model, self.dimension)
    }
}

impl EmbeddingSpace {
    pub fn of(fact: &Fact) -> Self {
        Self {
            model: fact.embedding_model.clone(),
            dimension: fact.embedding.len(),
        }
    }

    /// Refuse to mix a different model or dimension into this space
    pub fn ensure_matches(&self, other: &EmbeddingSpace) -> Result<(), MemoryError> {
        if self != other {
            return Err(MemoryError::EmbeddingMismatch {
                stored: self.to_string(),
                requested: other.to_string(),
            });
        }
        Ok(())
    }

    /// Dimension-only check for query vectors
    pub fn ensure_dimension(&self, dimension: usize) -> Result<(), MemoryError> {
        if self.dimension != dimension {
            return Err(MemoryError::EmbeddingMismatch {
                stored: self.to_string(),
                requested: format!("{} dims", dimension),
            });
        }
        Ok(())
    }
}

/// Result of `FactStore::insert`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(FactId),
    /// A near-duplicate already existed; nothing was written
    Duplicate(FactId),
}

impl InsertOutcome {
    pub fn id(&self) -> FactId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Duplicate(id) => *id,
        }
    }
}

/// Result of running the extractor over one utterance
#[derive(Debug, Clone)]
pub enum Extraction {
    Fact(Fact),
    NoFact,
    /// The classification or embedding call failed; treated as no fact
    Unavailable(MemoryError),
}

impl Extraction {
    pub fn into_fact(self) -> Option<Fact> {
        match self {
            Extraction::Fact(fact) => Some(fact),
            _ => None,
        }
    }
}

/// What happened to an utterance or fact handed to the memory manager
#[derive(Debug, Clone)]
pub enum RememberOutcome {
    Stored(FactId),
    Duplicate(FactId),
    NoFact,
    /// Memory bookkeeping failed; the conversation is unaffected
    Degraded(MemoryError),
}

impl RememberOutcome {
    pub fn fact_id(&self) -> Option<FactId> {
        match self {
            RememberOutcome::Stored(id) | RememberOutcome::Duplicate(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<InsertOutcome> for RememberOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted(id) => RememberOutcome::Stored(id),
            InsertOutcome::Duplicate(id) => RememberOutcome::Duplicate(id),
        }
    }
}

/// Matches found (and possibly removed) by `forget`
#[derive(Debug, Clone, Serialize)]
pub struct ForgetReport {
    pub matches: Vec<ScoredFact>,
    pub deleted: usize,
    pub confirmed: bool,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub backend: &'static str,
    pub location: String,
    pub total_facts: u64,
    pub embedding_space: Option<EmbeddingSpace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_creation() {
        let fact = Fact::new("alice", "User prefers Python language", "I like Python")
            .with_embedding(vec![0.1, 0.2], "test-model");

        assert_eq!(fact.scope, "alice");
        assert_eq!(fact.text, "User prefers Python language");
        assert_eq!(fact.source_utterance, "I like Python");
        assert_eq!(fact.embedding_model, "test-model");
        assert!(fact.created_at > 0);
    }

    #[test]
    fn test_embedding_space_mismatch() {
        let stored = EmbeddingSpace {
            model: "a".into(),
            dimension: 3,
        };
        let other = EmbeddingSpace {
            model: "b".into(),
            dimension: 3,
        };
        assert!(stored.ensure_matches(&stored.clone()).is_ok());
        assert!(matches!(
            stored.ensure_matches(&other),
            Err(MemoryError::EmbeddingMismatch { .. })
        ));
        assert!(stored.ensure_dimension(4).is_err());
    }

    #[test]
    fn test_embedding_not_serialized_when_empty() {
        let fact = Fact::new("u", "User likes tea", "I like tea");
        let json = serde_json::to_value(&fact).unwrap();
        assert!(json.get("embedding").is_none());
        assert_eq!(json["text"], "User likes tea");
    }
}
