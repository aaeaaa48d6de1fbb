//! ============================================================================
//! Recall Engine - Relevant facts for the next model call
//! ============================================================================
//! Embeds the query with the store's embedding model, searches the store and
//! drops everything under the similarity threshold. Query embeddings and
//! search results are cached with a short TTL; results for a scope are
//! invalidated whenever that scope is written.
//! ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::embeddings::Embedder;
use super::store::FactStore;
use super::types::{Fact, FactQuery, ScoredFact};
use crate::types::MemoryError;

/// Cached query embedding
#[derive(Debug, Clone)]
struct CachedEmbedding {
    embedding: Vec<f32>,
    cached_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResultKey {
    scope: String,
    query: String,
    k: usize,
}

/// Cached search results, before the threshold is applied
#[derive(Debug, Clone)]
struct CachedResults {
    results: Vec<ScoredFact>,
    cached_at: Instant,
}

#[derive(Default)]
struct CacheState {
    embeddings: HashMap<String, CachedEmbedding>,
    results: HashMap<ResultKey, CachedResults>,
    /// Bumped on every write to a scope
    generations: HashMap<String, u64>,
}

/// TTL cache for query embeddings and per-scope search results
pub struct RecallCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    capacity: usize,
}

impl RecallCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// No caching at all
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    async fn embedding(&self, query: &str) -> Option<Vec<f32>> {
        let state = self.state.read().await;
        let cached = state.embeddings.get(query)?;
        (cached.cached_at.elapsed() < self.ttl).then(|| cached.embedding.clone())
    }

    async fn put_embedding(&self, query: &str, embedding: Vec<f32>) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.write().await;
        // Evict oldest entry if cache is at capacity
        if state.embeddings.len() >= self.capacity && !state.embeddings.contains_key(query) {
            if let Some(oldest_key) = state
                .embeddings
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                state.embeddings.remove(&oldest_key);
            }
        }
        state.embeddings.insert(
            query.to_string(),
            CachedEmbedding {
                embedding,
                cached_at: Instant::now(),
            },
        );
    }

    async fn generation(&self, scope: &str) -> u64 {
        self.state
            .read()
            .await
            .generations
            .get(scope)
            .copied()
            .unwrap_or(0)
    }

    async fn results(&self, key: &ResultKey) -> Option<Vec<ScoredFact>> {
        let state = self.state.read().await;
        let cached = state.results.get(key)?;
        (cached.cached_at.elapsed() < self.ttl).then(|| cached.results.clone())
    }

    /// Store results read at `generation`; dropped if the scope was written since
    async fn put_results(&self, key: ResultKey, generation: u64, results: Vec<ScoredFact>) {
        if !self.enabled() {
            return;
        }
        let mut state = self.state.write().await;
        if state.generations.get(&key.scope).copied().unwrap_or(0) != generation {
            debug!("Scope {} written during recall, not caching", key.scope);
            return;
        }
        if state.results.len() >= self.capacity && !state.results.contains_key(&key) {
            if let Some(oldest_key) = state
                .results
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                state.results.remove(&oldest_key);
            }
        }
        state.results.insert(
            key,
            CachedResults {
                results,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop every cached result for `scope`
    pub async fn invalidate(&self, scope: &str) {
        let mut state = self.state.write().await;
        *state.generations.entry(scope.to_string()).or_insert(0) += 1;
        let before = state.results.len();
        state.results.retain(|key, _| key.scope != scope);
        debug!(
            "Invalidated {} cached recalls for scope {}",
            before - state.results.len(),
            scope
        );
    }

    /// (embeddings, result lists) currently held
    pub async fn len(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.embeddings.len(), state.results.len())
    }
}

/// Read path: query text -> relevant facts
pub struct RecallEngine {
    store: Arc<dyn FactStore>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    timeout: Duration,
    cache: RecallCache,
}

impl RecallEngine {
    pub fn new(
        store: Arc<dyn FactStore>,
        embedder: Arc<dyn Embedder>,
        threshold: f32,
        timeout: Duration,
        cache: RecallCache,
    ) -> Self {
        Self {
            store,
            embedder,
            threshold,
            timeout,
            cache,
        }
    }

    pub fn cache(&self) -> &RecallCache {
        &self.cache
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Canonical texts of the facts relevant to `query`, best first.
    /// Any failure is logged and yields no memories.
    pub async fn recall(&self, scope: &str, query: &str, k: usize) -> Vec<String> {
        match self.try_recall(scope, &FactQuery::new(query, k)).await {
            Ok(results) => results.into_iter().map(|r| r.fact.text).collect(),
            Err(e) => {
                warn!("Recall degraded to no memories: {}", e);
                vec![]
            }
        }
    }

    /// Scored facts at or above the threshold, best first
    pub async fn try_recall(
        &self,
        scope: &str,
        query: &FactQuery,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        if query.text.trim().is_empty() || query.k == 0 {
            return Ok(vec![]);
        }
        let threshold = query.threshold.unwrap_or(self.threshold);

        let key = ResultKey {
            scope: scope.to_string(),
            query: query.text.clone(),
            k: query.k,
        };
        let results = match self.cache.results(&key).await {
            Some(results) => {
                debug!("Recall cache hit for scope {}", scope);
                results
            }
            None => {
                let generation = self.cache.generation(scope).await;
                let embedding = self.embed_query(&query.text).await?;
                let results = self.search(scope, &embedding, query.k).await?;
                self.cache.put_results(key, generation, results.clone()).await;
                results
            }
        };

        let relevant: Vec<ScoredFact> = results
            .into_iter()
            .filter(|r| r.score >= threshold)
            .collect();
        debug!(
            "Recalled {} facts for scope {} (threshold {:.2})",
            relevant.len(),
            scope,
            threshold
        );
        Ok(relevant)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        if let Some(embedding) = self.cache.embedding(text).await {
            return Ok(embedding);
        }

        let embedding = tokio::time::timeout(self.timeout, self.embedder.embed_single(text))
            .await
            .map_err(|_| {
                MemoryError::EmbeddingUnavailable(format!(
                    "query embedding timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| MemoryError::EmbeddingUnavailable(e.to_string()))?;

        self.cache.put_embedding(text, embedding.clone()).await;
        Ok(embedding)
    }

    async fn search(
        &self,
        scope: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        tokio::time::timeout(self.timeout, self.store.search(scope, embedding, k))
            .await
            .map_err(|_| {
                MemoryError::StoreUnavailable(format!(
                    "search timed out after {:?}",
                    self.timeout
                ))
            })?
    }
}

/// Render recalled facts as the block injected before the user's turn.
///
/// Newest first with their dates, so contradicting preferences resolve in
/// favor of the latest statement. `None` when there is nothing to inject.
pub fn format_memories_for_prompt(facts: &[Fact]) -> Option<String> {
    if facts.is_empty() {
        return None;
    }

    let mut ordered: Vec<&Fact> = facts.iter().collect();
    ordered.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.sequence.cmp(&a.sequence))
    });

    let mut block = String::from("Relevant memories:\n");
    for fact in ordered {
        block.push_str(&format!("- [{}] {}\n", fact.created_date(), fact.text));
    }
    block.push_str(
        "If any of these conflict, the more recent memory reflects the user's current preference.",
    );
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::RedbFactStore;
    use crate::memory::testing::{KeywordEmbedder, SlowEmbedder, SlowStore, UnavailableStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<RedbFactStore>,
        embedder: Arc<KeywordEmbedder>,
        engine: RecallEngine,
    }

    fn fixture(cache: RecallCache) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbFactStore::open(dir.path().join("memory.redb"), 0.85).unwrap());
        let embedder = Arc::new(KeywordEmbedder::new());
        let engine = RecallEngine::new(
            store.clone(),
            embedder.clone(),
            0.45,
            Duration::from_secs(2),
            cache,
        );
        Fixture {
            _dir: dir,
            store,
            embedder,
            engine,
        }
    }

    async fn insert(f: &Fixture, scope: &str, text: &str) {
        let fact = Fact::new(scope, text, "")
            .with_embedding(KeywordEmbedder::vector(text), KeywordEmbedder::MODEL);
        f.store.insert(fact).await.unwrap();
    }

    #[tokio::test]
    async fn test_recall_relevance() {
        let f = fixture(RecallCache::disabled());
        insert(&f, "u", "User prefers Python language").await;
        insert(&f, "u", "User dislikes seafood").await;

        let recalled = f
            .engine
            .recall("u", "what language should I use for this script?", 3)
            .await;
        assert_eq!(recalled, vec!["User prefers Python language".to_string()]);
    }

    #[tokio::test]
    async fn test_recall_empty_store() {
        let f = fixture(RecallCache::disabled());
        assert!(f.engine.recall("u", "what should I cook tonight?", 3).await.is_empty());
        assert!(f
            .engine
            .try_recall("u", &FactQuery::new("anything", 3))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_recall_below_threshold_is_empty() {
        let f = fixture(RecallCache::disabled());
        insert(&f, "u", "User dislikes seafood").await;
        assert!(f.engine.recall("u", "play some jazz music", 3).await.is_empty());

        // A per-query threshold overrides the default
        let loose = FactQuery::new("play some jazz music", 3).with_threshold(0.0);
        assert_eq!(f.engine.try_recall("u", &loose).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recall_store_unavailable_degrades() {
        let engine = RecallEngine::new(
            Arc::new(UnavailableStore),
            Arc::new(KeywordEmbedder::new()),
            0.45,
            Duration::from_secs(1),
            RecallCache::disabled(),
        );
        assert!(engine.recall("u", "what language?", 3).await.is_empty());
        assert!(matches!(
            engine.try_recall("u", &FactQuery::new("what language?", 3)).await,
            Err(MemoryError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_recall_slow_embedder_times_out() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbFactStore::open(dir.path().join("memory.redb"), 0.85).unwrap());
        let engine = RecallEngine::new(
            store,
            Arc::new(SlowEmbedder(Duration::from_secs(5))),
            0.45,
            Duration::from_millis(200),
            RecallCache::disabled(),
        );

        let started = std::time::Instant::now();
        assert!(matches!(
            engine.try_recall("u", &FactQuery::new("what language?", 3)).await,
            Err(MemoryError::EmbeddingUnavailable(_))
        ));
        assert!(engine.recall("u", "what language?", 3).await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_recall_slow_store_times_out() {
        let engine = RecallEngine::new(
            Arc::new(SlowStore(Duration::from_secs(5))),
            Arc::new(KeywordEmbedder::new()),
            0.45,
            Duration::from_millis(200),
            RecallCache::disabled(),
        );

        let started = std::time::Instant::now();
        assert!(matches!(
            engine.try_recall("u", &FactQuery::new("what language?", 3)).await,
            Err(MemoryError::StoreUnavailable(_))
        ));
        assert!(engine.recall("u", "what language?", 3).await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cache_reuses_query_embedding() {
        let f = fixture(RecallCache::new(Duration::from_secs(60), 16));
        insert(&f, "u", "User prefers Python language").await;

        f.engine.recall("u", "which language?", 3).await;
        f.engine.recall("u", "which language?", 3).await;
        assert_eq!(f.embedder.calls(), 1);
        assert_eq!(f.engine.cache().len().await, (1, 1));
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_write() {
        let f = fixture(RecallCache::new(Duration::from_secs(60), 16));
        insert(&f, "u", "User prefers Python language").await;
        assert_eq!(f.engine.recall("u", "which language?", 3).await.len(), 1);

        insert(&f, "u", "User learns Rust over dinner").await;
        // Stale until the scope is invalidated
        assert_eq!(f.engine.recall("u", "which language?", 3).await.len(), 1);

        f.engine.cache().invalidate("u").await;
        assert_eq!(f.engine.recall("u", "which language?", 3).await.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let f = fixture(RecallCache::new(Duration::from_millis(20), 16));
        insert(&f, "u", "User prefers Python language").await;

        f.engine.recall("u", "which language?", 3).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        f.engine.recall("u", "which language?", 3).await;
        assert_eq!(f.embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest_at_capacity() {
        let cache = RecallCache::new(Duration::from_secs(60), 2);
        cache.put_embedding("a", vec![1.0]).await;
        cache.put_embedding("b", vec![2.0]).await;
        cache.put_embedding("c", vec![3.0]).await;

        assert_eq!(cache.len().await.0, 2);
        assert!(cache.embedding("a").await.is_none());
        assert_eq!(cache.embedding("c").await, Some(vec![3.0]));
    }

    #[tokio::test]
    async fn test_results_not_cached_across_invalidation() {
        let cache = RecallCache::new(Duration::from_secs(60), 8);
        let key = ResultKey {
            scope: "u".into(),
            query: "q".into(),
            k: 3,
        };
        let generation = cache.generation("u").await;
        cache.invalidate("u").await;
        cache.put_results(key.clone(), generation, vec![]).await;
        assert!(cache.results(&key).await.is_none());
    }

    #[test]
    fn test_format_memories_newest_first() {
        assert!(format_memories_for_prompt(&[]).is_none());

        let mut older = Fact::new("u", "User likes Python", "");
        older.created_at = 1_700_000_000_000;
        older.sequence = 1;
        let mut newer = Fact::new("u", "User hates Python", "");
        newer.created_at = 1_750_000_000_000;
        newer.sequence = 2;

        let block = format_memories_for_prompt(&[older, newer]).unwrap();
        assert!(block.starts_with("Relevant memories:\n"));
        let hates = block.find("User hates Python").unwrap();
        let likes = block.find("User likes Python").unwrap();
        assert!(hates < likes);
        assert!(block.contains("[2025-06-15] User hates Python"));
        assert!(block.contains("more recent memory"));
    }
}
