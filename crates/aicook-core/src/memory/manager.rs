//! ============================================================================
//! Memory Manager - Orchestrates fact capture, recall and removal
//! ============================================================================
//! One manager owns the store, the extractor and the recall engine and is
//! shared by every session behind an `Arc`. Writes through the manager keep
//! the recall cache coherent.
//! ============================================================================

use futures_util::stream::{BoxStream, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::canonical::{is_canonical, normalize};
use super::embeddings::{create_embedding_service, Embedder};
use super::extractor::{create_classifier, FactClassifier, FactExtractor};
use super::qdrant::QdrantFactStore;
use super::recall::{RecallCache, RecallEngine};
use super::store::{FactStore, RedbFactStore};
use super::types::{
    EmbeddingSpace, Extraction, Fact, FactQuery, ForgetReport, InsertOutcome, RememberOutcome,
    ScoredFact, StoreStats,
};
use crate::config::MemoryConfig;
use crate::llm::TextGenerator;
use crate::types::MemoryError;

/// Default similarity a fact needs to be matched by `forget`
pub const FORGET_THRESHOLD: f32 = 0.85;

/// Default number of facts `forget` considers
pub const FORGET_TOP_N: usize = 3;

/// Memory manager combining store, extractor and recall
pub struct MemoryManager {
    store: Arc<dyn FactStore>,
    embedder: Arc<dyn Embedder>,
    extractor: FactExtractor,
    recall: RecallEngine,
    default_k: usize,
    timeout: Duration,
}

impl MemoryManager {
    /// Create a manager over an open store.
    ///
    /// Fails with `EmbeddingMismatch` when the store was filled by a
    /// different embedding model than `embedder`.
    pub async fn new(
        store: Arc<dyn FactStore>,
        classifier: Arc<dyn FactClassifier>,
        embedder: Arc<dyn Embedder>,
        config: &MemoryConfig,
    ) -> Result<Self, MemoryError> {
        let timeout = config.request_timeout();
        let pinned = tokio::time::timeout(timeout, store.embedding_space())
            .await
            .map_err(|_| {
                MemoryError::StoreUnavailable(format!(
                    "store call timed out after {:?}",
                    timeout
                ))
            })??;
        if let Some(space) = pinned {
            if space.model != embedder.model() {
                return Err(MemoryError::EmbeddingMismatch {
                    stored: space.to_string(),
                    requested: embedder.model().to_string(),
                });
            }
        }

        let extractor = FactExtractor::new(classifier, embedder.clone(), timeout);
        let recall = RecallEngine::new(
            store.clone(),
            embedder.clone(),
            config.similarity_threshold,
            timeout,
            RecallCache::new(config.cache_ttl(), config.cache_size),
        );

        Ok(Self {
            store,
            embedder,
            extractor,
            recall,
            default_k: config.default_k,
            timeout,
        })
    }

    /// Build the configured store backend, the embedding service and the
    /// configured classifier (the LLM one runs on `generator`)
    pub async fn from_config(
        config: &MemoryConfig,
        generator: Arc<dyn TextGenerator>,
    ) -> Result<Self, MemoryError> {
        let store: Arc<dyn FactStore> = match &config.qdrant_url {
            Some(url) => Arc::new(QdrantFactStore::new(url, config.dedup_threshold).await?),
            None => Arc::new(RedbFactStore::open(
                config.resolve_store_path()?,
                config.dedup_threshold,
            )?),
        };
        let embedder = Arc::new(create_embedding_service(config)?);
        let classifier = create_classifier(config, generator);

        Self::new(store, classifier, embedder, config).await
    }

    pub fn default_k(&self) -> usize {
        self.default_k
    }

    pub fn embedding_model(&self) -> &str {
        self.embedder.model()
    }

    /// Run extraction over one user turn and store the fact it yields.
    ///
    /// Never fails: extraction and store problems come back as `Degraded`.
    pub async fn observe(&self, scope: &str, utterance: &str) -> RememberOutcome {
        let fact = match self.extractor.extract(scope, utterance).await {
            Extraction::Fact(fact) => fact,
            Extraction::NoFact => return RememberOutcome::NoFact,
            Extraction::Unavailable(e) => return RememberOutcome::Degraded(e),
        };

        match self.insert(fact).await {
            Ok(outcome) => outcome.into(),
            Err(e) => {
                warn!("Dropped fact for scope {}: {}", scope, e);
                RememberOutcome::Degraded(e)
            }
        }
    }

    /// Store an explicitly given fact. The text must already be a canonical
    /// third-person sentence once normalized.
    pub async fn remember_fact(
        &self,
        scope: &str,
        text: &str,
    ) -> Result<RememberOutcome, MemoryError> {
        let text = normalize(text);
        if !is_canonical(&text) {
            return Err(MemoryError::MalformedExtraction(format!(
                "not a canonical fact: {}",
                text
            )));
        }

        let embedding = self.embed(&text).await?;
        let fact = Fact::new(scope, text.as_str(), text.as_str())
            .with_embedding(embedding, self.embedder.model());
        Ok(self.insert(fact).await?.into())
    }

    /// Find facts similar to `text`; delete them when `confirm` is set.
    ///
    /// `threshold` defaults to `FORGET_THRESHOLD`, `top_n` to `FORGET_TOP_N`.
    pub async fn forget(
        &self,
        scope: &str,
        text: &str,
        threshold: Option<f32>,
        top_n: Option<usize>,
        confirm: bool,
    ) -> Result<ForgetReport, MemoryError> {
        let threshold = threshold.unwrap_or(FORGET_THRESHOLD);
        let top_n = top_n.unwrap_or(FORGET_TOP_N);

        let embedding = self.embed(text).await?;
        let matches: Vec<ScoredFact> = self
            .bounded(self.store.search(scope, &embedding, top_n))
            .await?
            .into_iter()
            .filter(|r| r.score >= threshold)
            .collect();

        if matches.is_empty() {
            debug!("No facts similar to {:?} in scope {}", text, scope);
        }
        if !confirm || matches.is_empty() {
            return Ok(ForgetReport {
                matches,
                deleted: 0,
                confirmed: confirm,
            });
        }

        let ids: Vec<_> = matches.iter().map(|r| r.fact.id).collect();
        let deleted = self.bounded(self.store.delete(scope, &ids)).await;
        self.recall.cache().invalidate(scope).await;
        let deleted = deleted?;

        info!("Forgot {} facts in scope {}", deleted, scope);
        Ok(ForgetReport {
            matches,
            deleted,
            confirmed: true,
        })
    }

    /// Canonical texts relevant to `query`; empty on any failure
    pub async fn recall(&self, scope: &str, query: &str, k: usize) -> Vec<String> {
        self.recall.recall(scope, query, k).await
    }

    /// Scored recall that reports failures instead of degrading
    pub async fn recall_scored(
        &self,
        scope: &str,
        query: &FactQuery,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        self.recall.try_recall(scope, query).await
    }

    /// Every fact in `scope`, oldest first
    pub async fn list(&self, scope: &str) -> Result<Vec<Fact>, MemoryError> {
        self.store.all(scope).try_collect().await
    }

    /// Lazy variant of `list` for large exports
    pub fn facts<'a>(&'a self, scope: &'a str) -> BoxStream<'a, Result<Fact, MemoryError>> {
        self.store.all(scope)
    }

    pub async fn count(&self, scope: &str) -> Result<usize, MemoryError> {
        self.bounded(self.store.count(scope)).await
    }

    /// Delete every fact in `scope`
    pub async fn clear(&self, scope: &str) -> Result<usize, MemoryError> {
        let removed = self.bounded(self.store.clear(scope)).await;
        self.recall.cache().invalidate(scope).await;
        removed
    }

    pub async fn stats(&self) -> Result<StoreStats, MemoryError> {
        self.bounded(self.store.stats()).await
    }

    pub async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        self.bounded(self.store.embedding_space()).await
    }

    /// Check if the memory system is healthy
    pub async fn health_check(&self) -> bool {
        tokio::time::timeout(self.timeout, self.store.health_check())
            .await
            .unwrap_or(false)
    }

    async fn insert(&self, fact: Fact) -> Result<InsertOutcome, MemoryError> {
        let scope = fact.scope.clone();
        let outcome = self.bounded(self.store.insert(fact)).await;
        // A timed-out insert may still commit
        if !matches!(outcome, Ok(InsertOutcome::Duplicate(_))) {
            self.recall.cache().invalidate(&scope).await;
        }
        outcome
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        tokio::time::timeout(self.timeout, self.embedder.embed_single(text))
            .await
            .map_err(|_| {
                MemoryError::EmbeddingUnavailable(format!(
                    "embedding timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))
    }

    /// Bound a store call by the request timeout
    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, MemoryError>>,
    ) -> Result<T, MemoryError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                MemoryError::StoreUnavailable(format!(
                    "store call timed out after {:?}",
                    self.timeout
                ))
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::extractor::HeuristicClassifier;
    use crate::memory::LlmClassifier;
    use crate::memory::testing::{
        FailingGenerator, KeywordEmbedder, SlowEmbedder, SlowStore, UnavailableStore,
    };
    use std::path::Path;
    use tempfile::TempDir;

    async fn manager_at(path: &Path) -> MemoryManager {
        let store = Arc::new(RedbFactStore::open(path, 0.85).unwrap());
        MemoryManager::new(
            store,
            Arc::new(HeuristicClassifier),
            Arc::new(KeywordEmbedder::new()),
            &MemoryConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_paraphrases_collapse_to_one_fact() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir.path().join("memory.redb")).await;

        let first = manager.observe("u", "I like Python").await;
        let second = manager.observe("u", "Python is my favorite language").await;

        assert!(matches!(first, RememberOutcome::Stored(_)));
        match second {
            RememberOutcome::Duplicate(id) => assert_eq!(Some(id), first.fact_id()),
            other => panic!("expected duplicate, got {:?}", other),
        }
        let facts = manager.list("u").await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].text, "User likes Python");
    }

    #[tokio::test]
    async fn test_observe_small_talk_is_no_fact() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir.path().join("memory.redb")).await;

        assert!(matches!(
            manager.observe("u", "what's a good name for a cat?").await,
            RememberOutcome::NoFact
        ));
        assert_eq!(manager.count("u").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_generator_records_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbFactStore::open(dir.path().join("memory.redb"), 0.85).unwrap());
        let manager = MemoryManager::new(
            store,
            Arc::new(LlmClassifier::new(Arc::new(FailingGenerator))),
            Arc::new(KeywordEmbedder::new()),
            &MemoryConfig::default(),
        )
        .await
        .unwrap();

        match manager.observe("u", "I like Python").await {
            RememberOutcome::Degraded(e) => {
                assert!(matches!(e, MemoryError::ExtractionUnavailable(_)));
                assert!(e.is_recoverable());
            }
            other => panic!("expected degraded, got {:?}", other),
        }
        assert_eq!(manager.count("u").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_unavailable_degrades() {
        let manager = MemoryManager::new(
            Arc::new(UnavailableStore),
            Arc::new(HeuristicClassifier),
            Arc::new(KeywordEmbedder::new()),
            &MemoryConfig::default(),
        )
        .await
        .unwrap();

        assert!(matches!(
            manager.observe("u", "I like Python").await,
            RememberOutcome::Degraded(MemoryError::StoreUnavailable(_))
        ));
        assert!(manager.recall("u", "which language?", 3).await.is_empty());
        assert!(!manager.health_check().await);
    }

    #[tokio::test]
    async fn test_remember_fact_requires_canonical_text() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir.path().join("memory.redb")).await;

        assert!(matches!(
            manager.remember_fact("u", "I like tea").await,
            Err(MemoryError::MalformedExtraction(_))
        ));
        let outcome = manager.remember_fact("u", "  User likes tea.  ").await.unwrap();
        assert!(matches!(outcome, RememberOutcome::Stored(_)));
        assert_eq!(manager.list("u").await.unwrap()[0].text, "User likes tea");
    }

    #[tokio::test]
    async fn test_forget_previews_then_deletes() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir.path().join("memory.redb")).await;
        manager.remember_fact("u", "User likes tea").await.unwrap();
        manager.remember_fact("u", "User likes jazz music").await.unwrap();

        let preview = manager.forget("u", "tea", None, None, false).await.unwrap();
        assert_eq!(preview.matches.len(), 1);
        assert_eq!(preview.matches[0].fact.text, "User likes tea");
        assert_eq!(preview.deleted, 0);
        assert!(!preview.confirmed);
        assert_eq!(manager.count("u").await.unwrap(), 2);

        let report = manager.forget("u", "tea", None, None, true).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(report.confirmed);
        let remaining = manager.list("u").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].text, "User likes jazz music");
    }

    #[tokio::test]
    async fn test_writes_invalidate_cached_recall() {
        let dir = TempDir::new().unwrap();
        let manager = manager_at(&dir.path().join("memory.redb")).await;

        assert!(manager.recall("u", "which language?", 3).await.is_empty());
        manager.observe("u", "I like Python").await;
        assert_eq!(
            manager.recall("u", "which language?", 3).await,
            vec!["User likes Python".to_string()]
        );

        manager.clear("u").await.unwrap();
        assert!(manager.recall("u", "which language?", 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_refuses_store_from_other_embedding_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.redb");
        {
            let manager = manager_at(&path).await;
            manager.observe("u", "I like Python").await;
        }

        let store = Arc::new(RedbFactStore::open(&path, 0.85).unwrap());
        let result = MemoryManager::new(
            store,
            Arc::new(HeuristicClassifier),
            Arc::new(KeywordEmbedder::with_model("another-model")),
            &MemoryConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(MemoryError::EmbeddingMismatch { .. })));
    }

    #[tokio::test]
    async fn test_facts_survive_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.redb");
        {
            let manager = manager_at(&path).await;
            manager.observe("u", "I prefer Python for scripting").await;
        }

        let manager = manager_at(&path).await;
        let recalled = manager
            .recall("u", "what language should I use for this script?", 3)
            .await;
        assert_eq!(recalled, vec!["User prefers Python for scripting".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_share_store() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(manager_at(&dir.path().join("memory.redb")).await);

        let utterances = [
            ("alice", "I like Python"),
            ("alice", "I dislike seafood"),
            ("bob", "I like jazz"),
            ("bob", "what should I cook tonight?"),
            ("carol", "My name is Carol"),
        ];
        let mut handles = Vec::new();
        for (scope, utterance) in utterances {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.observe(scope, utterance).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(manager.count("alice").await.unwrap(), 2);
        assert_eq!(manager.count("bob").await.unwrap(), 1);
        assert_eq!(manager.count("carol").await.unwrap(), 1);
    }

    fn one_second() -> MemoryConfig {
        MemoryConfig {
            request_timeout_secs: 1,
            ..MemoryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_slow_store_calls_are_bounded() {
        let manager = MemoryManager::new(
            Arc::new(SlowStore(Duration::from_secs(30))),
            Arc::new(HeuristicClassifier),
            Arc::new(KeywordEmbedder::new()),
            &one_second(),
        )
        .await
        .unwrap();

        let started = std::time::Instant::now();
        match manager.observe("u", "I like Python").await {
            RememberOutcome::Degraded(MemoryError::StoreUnavailable(_)) => {}
            other => panic!("expected StoreUnavailable, got {:?}", other),
        }
        assert!(manager.recall("u", "what language should I use?", 3).await.is_empty());
        assert!(matches!(
            manager.count("u").await,
            Err(MemoryError::StoreUnavailable(_))
        ));
        assert!(!manager.health_check().await);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_slow_embedder_is_bounded() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbFactStore::open(dir.path().join("memory.redb"), 0.85).unwrap());
        let manager = MemoryManager::new(
            store,
            Arc::new(HeuristicClassifier),
            Arc::new(SlowEmbedder(Duration::from_secs(30))),
            &one_second(),
        )
        .await
        .unwrap();

        let started = std::time::Instant::now();
        assert!(matches!(
            manager.remember_fact("u", "User likes tea").await,
            Err(MemoryError::EmbeddingUnavailable(_))
        ));
        assert!(matches!(
            manager.forget("u", "User likes tea", None, None, false).await,
            Err(MemoryError::EmbeddingUnavailable(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
