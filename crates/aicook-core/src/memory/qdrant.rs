//! ============================================================================
//! Qdrant Fact Store - Remote vector database backend
//! ============================================================================
//! Selected when QDRANT_URL is set. The collection is created on the first
//! insert with that fact's dimension; every point carries its scope and
//! embedding model in the payload. Several processes may share a collection:
//! an unsettled pin is reloaded on use and sequences follow the newest point.
//! ============================================================================

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use qdrant_client::qdrant::{
    point_id::PointIdOptions, points_selector::PointsSelectorOneOf, vectors_config, Condition,
    CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Direction, Distance, FieldType, Filter, GetPointsBuilder,
    OrderByBuilder, PointId, PointStruct, PointsIdsList, Range, ScrollPointsBuilder,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::canonical::same_polarity;
use super::similarity::rank;
use super::store::{store_error, FactStore};
use super::types::{EmbeddingSpace, Fact, FactId, InsertOutcome, ScoredFact, StoreStats};
use crate::types::MemoryError;

/// Collection name for facts
pub const COLLECTION_NAME: &str = "aicook_facts";

const PAGE_SIZE: u32 = 64;

/// Candidates checked for a same-polarity duplicate
const DEDUP_CANDIDATES: u64 = 5;

/// Insert bookkeeping, guarded so dedup + upsert act as one step
#[derive(Debug, Default, PartialEq)]
struct WriteState {
    sequence: u64,
    last_created_at: i64,
}

impl WriteState {
    /// Catch up with a point written by another process
    fn observe(&mut self, newest: &Fact) {
        self.sequence = self.sequence.max(newest.sequence);
        self.last_created_at = self.last_created_at.max(newest.created_at);
    }
}

/// Fact store backed by a Qdrant collection
pub struct QdrantFactStore {
    client: Arc<Qdrant>,
    url: String,
    collection: String,
    dedup_threshold: f32,
    /// Model may be empty when the collection exists but holds no points
    space: RwLock<Option<EmbeddingSpace>>,
    writes: Mutex<WriteState>,
}

impl QdrantFactStore {
    /// Connect to Qdrant and load the pinned embedding space, if any
    pub async fn new(url: &str, dedup_threshold: f32) -> Result<Self, MemoryError> {
        Self::with_collection(url, COLLECTION_NAME, dedup_threshold).await
    }

    pub async fn with_collection(
        url: &str,
        collection: &str,
        dedup_threshold: f32,
    ) -> Result<Self, MemoryError> {
        debug!("Connecting to Qdrant at {} (collection {})", url, collection);

        let client = Qdrant::from_url(url)
            .build()
            .map_err(store_error("Failed to create Qdrant client"))?;

        let store = Self {
            client: Arc::new(client),
            url: url.to_string(),
            collection: collection.to_string(),
            dedup_threshold,
            space: RwLock::new(None),
            writes: Mutex::new(WriteState::default()),
        };
        *store.space.write().await = store.fetch_space().await?;

        Ok(store)
    }

    async fn collection_exists(&self) -> Result<bool, MemoryError> {
        self.client
            .collection_exists(&self.collection)
            .await
            .map_err(store_error("Failed to check collection existence"))
    }

    async fn fetch_newest(&self) -> Result<Option<Fact>, MemoryError> {
        Ok(self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .limit(1)
                    .with_payload(true)
                    .order_by(OrderByBuilder::new("sequence").direction(Direction::Desc as i32)),
            )
            .await
            .map_err(store_error("Failed to scroll facts"))?
            .result
            .into_iter()
            .find_map(|point| fact_from_payload(point.id?, point.payload)))
    }

    /// Vector size and newest model of the collection, `None` while it does not exist
    async fn fetch_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        if !self.collection_exists().await? {
            debug!("Collection {} not created yet", self.collection);
            return Ok(None);
        }

        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(store_error("Failed to get collection info"))?;
        let dimension = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|c| match c {
                vectors_config::Config::Params(params) => Some(params.size as usize),
                vectors_config::Config::ParamsMap(_) => None,
            })
            .ok_or_else(|| {
                MemoryError::StoreUnavailable("Collection has no single vector config".into())
            })?;

        let model = self
            .fetch_newest()
            .await?
            .map(|f| f.embedding_model)
            .unwrap_or_default();

        info!(
            "Collection {} pinned to {} dims (model: {})",
            self.collection, dimension, model
        );
        Ok(Some(EmbeddingSpace { model, dimension }))
    }

    async fn create_collection(&self, dimension: usize) -> Result<(), MemoryError> {
        info!("Creating collection: {}", self.collection);

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(store_error("Failed to create collection"))?;

        for (field, kind) in [("scope", FieldType::Keyword), ("sequence", FieldType::Integer)] {
            self.client
                .create_field_index(
                    CreateFieldIndexCollectionBuilder::new(&self.collection, field, kind)
                        .wait(true),
                )
                .await
                .map_err(store_error("Failed to create payload index"))?;
        }

        info!("Collection {} created successfully", self.collection);
        Ok(())
    }

    /// Pin the space on first use, or refuse a different one
    async fn ensure_space(&self, requested: &EmbeddingSpace) -> Result<(), MemoryError> {
        let mut space = self.space.write().await;
        if !is_settled(space.as_ref()) {
            *space = self.fetch_space().await?;
        }
        if space.is_none() {
            if let Err(e) = self.create_collection(requested.dimension).await {
                // Lost the race to another writer
                *space = self.fetch_space().await?;
                if space.is_none() {
                    return Err(e);
                }
                debug!("Collection {} created elsewhere", self.collection);
            }
        }
        *space = Some(pin(space.clone(), requested)?);
        Ok(())
    }

    /// The pinned space, reloaded until another writer has settled it
    async fn pinned(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        if let Some(space) = self.space.read().await.clone().filter(|s| !s.model.is_empty()) {
            return Ok(Some(space));
        }

        let mut space = self.space.write().await;
        if !is_settled(space.as_ref()) {
            *space = self.fetch_space().await?;
        }
        Ok(space.clone())
    }

    async fn find_duplicate(&self, fact: &Fact) -> Result<Option<(FactId, f32)>, MemoryError> {
        let candidates = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, fact.embedding.clone(), DEDUP_CANDIDATES)
                    .filter(scope_filter(&fact.scope))
                    .score_threshold(self.dedup_threshold)
                    .with_payload(true),
            )
            .await
            .map_err(store_error("Failed to search facts"))?;

        Ok(candidates.result.into_iter().find_map(|point| {
            let score = point.score;
            let existing = fact_from_payload(point.id?, point.payload)?;
            same_polarity(&existing.text, &fact.text).then_some((existing.id, score))
        }))
    }
}

fn is_settled(space: Option<&EmbeddingSpace>) -> bool {
    space.is_some_and(|s| !s.model.is_empty())
}

/// Combine the current pin with a writer's space
fn pin(
    current: Option<EmbeddingSpace>,
    requested: &EmbeddingSpace,
) -> Result<EmbeddingSpace, MemoryError> {
    match current {
        Some(mut pinned) if pinned.model.is_empty() => {
            pinned.ensure_dimension(requested.dimension)?;
            pinned.model = requested.model.clone();
            Ok(pinned)
        }
        Some(pinned) => {
            pinned.ensure_matches(requested)?;
            Ok(pinned)
        }
        None => Ok(requested.clone()),
    }
}

fn scope_filter(scope: &str) -> Filter {
    Filter::must([Condition::matches("scope", scope.to_string())])
}

fn point_id(id: &FactId) -> PointId {
    PointId::from(id.to_string())
}

#[async_trait]
impl FactStore for QdrantFactStore {
    async fn insert(&self, fact: Fact) -> Result<InsertOutcome, MemoryError> {
        if fact.embedding.is_empty() || fact.embedding_model.is_empty() {
            return Err(MemoryError::StoreUnavailable(
                "Cannot store fact without embedding".into(),
            ));
        }

        let mut writes = self.writes.lock().await;
        self.ensure_space(&EmbeddingSpace::of(&fact)).await?;
        if let Some(newest) = self.fetch_newest().await? {
            writes.observe(&newest);
        }

        if let Some((existing, score)) = self.find_duplicate(&fact).await? {
            debug!(
                "Skipped near-duplicate of {} (score {:.3}): {}",
                existing, score, fact.text
            );
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let mut fact = fact;
        fact.sequence = writes.sequence + 1;
        fact.created_at = fact.created_at.max(writes.last_created_at);

        let payload: HashMap<String, Value> = [
            ("scope".to_string(), Value::from(fact.scope.clone())),
            ("text".to_string(), Value::from(fact.text.clone())),
            (
                "embedding_model".to_string(),
                Value::from(fact.embedding_model.clone()),
            ),
            ("created_at".to_string(), Value::from(fact.created_at)),
            ("sequence".to_string(), Value::from(fact.sequence as i64)),
            (
                "source_utterance".to_string(),
                Value::from(fact.source_utterance.clone()),
            ),
        ]
        .into_iter()
        .collect();

        let point = PointStruct::new(fact.id.to_string(), fact.embedding.clone(), payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(store_error("Failed to upsert fact"))?;

        writes.sequence = fact.sequence;
        writes.last_created_at = fact.created_at;

        info!("Stored fact {}: {}", fact.id, fact.text);
        Ok(InsertOutcome::Inserted(fact.id))
    }

    async fn search(
        &self,
        scope: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        let Some(space) = self.pinned().await? else {
            return Ok(vec![]);
        };
        space.ensure_dimension(embedding.len())?;
        if k == 0 {
            return Ok(vec![]);
        }

        debug!("Searching facts for scope {} (limit: {})", scope, k);

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, embedding.to_vec(), k as u64)
                    .filter(scope_filter(scope))
                    .with_payload(true),
            )
            .await
            .map_err(store_error("Failed to search facts"))?;

        let mut results: Vec<ScoredFact> = search_result
            .result
            .into_iter()
            .filter_map(|point| {
                let score = point.score;
                let fact = fact_from_payload(point.id?, point.payload)?;
                Some(ScoredFact { fact, score })
            })
            .collect();
        rank(&mut results);

        debug!("Found {} matching facts", results.len());
        Ok(results)
    }

    fn all<'a>(&'a self, scope: &'a str) -> BoxStream<'a, Result<Fact, MemoryError>> {
        let client = self.client.clone();
        let collection = self.collection.clone();
        let scope = scope.to_string();

        stream::try_unfold(Some(0u64), move |after| {
            let client = client.clone();
            let collection = collection.clone();
            let scope = scope.clone();
            async move {
                let Some(after) = after else {
                    return Ok::<_, MemoryError>(None);
                };
                if !client
                    .collection_exists(&collection)
                    .await
                    .map_err(store_error("Failed to check collection existence"))?
                {
                    return Ok(None);
                }

                let filter = Filter::must([
                    Condition::matches("scope", scope),
                    Condition::range(
                        "sequence",
                        Range {
                            gt: Some(after as f64),
                            ..Default::default()
                        },
                    ),
                ]);
                let page = client
                    .scroll(
                        ScrollPointsBuilder::new(&collection)
                            .filter(filter)
                            .limit(PAGE_SIZE)
                            .with_payload(true)
                            .order_by(OrderByBuilder::new("sequence")),
                    )
                    .await
                    .map_err(store_error("Failed to scroll facts"))?;

                let full = page.result.len() == PAGE_SIZE as usize;
                let facts: Vec<Fact> = page
                    .result
                    .into_iter()
                    .filter_map(|point| fact_from_payload(point.id?, point.payload))
                    .collect();
                let next = match facts.last() {
                    Some(last) if full => Some(last.sequence),
                    _ => None,
                };
                Ok(Some((facts, next)))
            }
        })
        .map_ok(|facts| stream::iter(facts.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn get(&self, id: &FactId) -> Result<Option<Fact>, MemoryError> {
        if self.pinned().await?.is_none() {
            return Ok(None);
        }

        let response = self
            .client
            .get_points(GetPointsBuilder::new(&self.collection, vec![point_id(id)]).with_payload(true))
            .await
            .map_err(store_error("Failed to get fact"))?;

        Ok(response
            .result
            .into_iter()
            .find_map(|point| fact_from_payload(point.id?, point.payload)))
    }

    async fn delete(&self, scope: &str, ids: &[FactId]) -> Result<usize, MemoryError> {
        if ids.is_empty() || self.pinned().await?.is_none() {
            return Ok(0);
        }

        let existing = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, ids.iter().map(point_id).collect::<Vec<_>>())
                    .with_payload(true),
            )
            .await
            .map_err(store_error("Failed to get facts"))?;

        let doomed: Vec<PointId> = existing
            .result
            .into_iter()
            .filter_map(|point| fact_from_payload(point.id?, point.payload))
            .filter(|fact| fact.scope == scope)
            .map(|fact| point_id(&fact.id))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let removed = doomed.len();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsSelectorOneOf::Points(PointsIdsList { ids: doomed }))
                    .wait(true),
            )
            .await
            .map_err(store_error("Failed to delete facts"))?;

        info!("Deleted {} facts from scope {}", removed, scope);
        Ok(removed)
    }

    async fn clear(&self, scope: &str) -> Result<usize, MemoryError> {
        let removed = self.count(scope).await?;
        if removed == 0 {
            return Ok(0);
        }

        info!("Deleting all facts for scope {}", scope);
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsSelectorOneOf::Filter(scope_filter(scope)))
                    .wait(true),
            )
            .await
            .map_err(store_error("Failed to delete facts"))?;

        Ok(removed)
    }

    async fn count(&self, scope: &str) -> Result<usize, MemoryError> {
        if self.pinned().await?.is_none() {
            return Ok(0);
        }

        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(scope_filter(scope))
                    .exact(true),
            )
            .await
            .map_err(store_error("Failed to count facts"))?;

        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn stats(&self) -> Result<StoreStats, MemoryError> {
        let space = self.pinned().await?;
        let total_facts = if space.is_some() {
            let info = self
                .client
                .collection_info(&self.collection)
                .await
                .map_err(store_error("Failed to get collection info"))?;
            info.result.and_then(|r| r.points_count).unwrap_or(0)
        } else {
            0
        };

        Ok(StoreStats {
            backend: "qdrant",
            location: format!("{}/collections/{}", self.url, self.collection),
            total_facts,
            embedding_space: space.filter(|s| !s.model.is_empty()),
        })
    }

    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        Ok(self.pinned().await?.filter(|s| !s.model.is_empty()))
    }

    async fn health_check(&self) -> bool {
        match self.client.health_check().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                false
            }
        }
    }
}

// Helper to extract UUID from PointId
fn extract_uuid_from_point_id(point_id: PointId) -> Option<Uuid> {
    match point_id.point_id_options? {
        PointIdOptions::Uuid(uuid_str) => Uuid::parse_str(&uuid_str).ok(),
        PointIdOptions::Num(_) => None, // Facts use UUID ids
    }
}

fn fact_from_payload(point_id: PointId, payload: HashMap<String, Value>) -> Option<Fact> {
    Some(Fact {
        id: extract_uuid_from_point_id(point_id)?,
        scope: get_string(&payload, "scope")?,
        text: get_string(&payload, "text")?,
        embedding: vec![], // Not returned without with_vectors
        embedding_model: get_string(&payload, "embedding_model").unwrap_or_default(),
        created_at: get_i64(&payload, "created_at").unwrap_or(0),
        sequence: get_i64(&payload, "sequence").unwrap_or(0) as u64,
        source_utterance: get_string(&payload, "source_utterance").unwrap_or_default(),
    })
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn get_i64(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    payload.get(key).and_then(|v| v.as_integer())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Integration tests require a running Qdrant instance
    // These are marked as ignored by default

    #[tokio::test]
    #[ignore]
    async fn test_insert_search_and_clear() {
        let store = QdrantFactStore::new("http://localhost:6334", 0.85).await.unwrap();
        let scope = format!("test-{}", Uuid::new_v4());

        let fact = Fact::new(scope.as_str(), "User prefers Python language", "I like Python")
            .with_embedding(vec![0.1; 8], "test-model");
        let id = store.insert(fact).await.unwrap().id();

        let results = store.search(&scope, &[0.1; 8], 3).await.unwrap();
        assert_eq!(results[0].fact.id, id);
        assert_eq!(results[0].fact.text, "User prefers Python language");

        // Paraphrase within the dedup threshold
        let again = Fact::new(scope.as_str(), "User prefers the Python language", "")
            .with_embedding(vec![0.1; 8], "test-model");
        assert_eq!(store.insert(again).await.unwrap(), InsertOutcome::Duplicate(id));

        assert_eq!(store.clear(&scope).await.unwrap(), 1);
        assert!(store.search(&scope, &[0.1; 8], 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn test_collection_created_by_another_writer() {
        let collection = format!("aicook_test_{}", Uuid::new_v4().simple());
        let url = "http://localhost:6334";

        // Opened before the collection exists
        let early = QdrantFactStore::with_collection(url, &collection, 0.85).await.unwrap();
        let late = QdrantFactStore::with_collection(url, &collection, 0.85).await.unwrap();

        let theirs = Fact::new("u", "User prefers Python language", "")
            .with_embedding(vec![1.0, 0.0, 0.0, 0.0], "test-model");
        let their_id = late.insert(theirs).await.unwrap().id();

        let found = early.search("u", &[1.0, 0.0, 0.0, 0.0], 3).await.unwrap();
        assert_eq!(found[0].fact.id, their_id);
        assert_eq!(early.count("u").await.unwrap(), 1);
        assert_eq!(
            early.embedding_space().await.unwrap(),
            Some(EmbeddingSpace {
                model: "test-model".into(),
                dimension: 4,
            })
        );

        let ours = Fact::new("u", "User dislikes seafood", "")
            .with_embedding(vec![0.0, 1.0, 0.0, 0.0], "test-model");
        let our_id = early.insert(ours).await.unwrap().id();
        let ours = early.get(&our_id).await.unwrap().unwrap();
        let theirs = early.get(&their_id).await.unwrap().unwrap();
        assert!(ours.sequence > theirs.sequence);

        early.client.delete_collection(&collection).await.unwrap();
    }

    #[test]
    fn test_pin_adopts_or_refuses() {
        let requested = EmbeddingSpace {
            model: "m".into(),
            dimension: 4,
        };
        assert_eq!(pin(None, &requested).unwrap(), requested);

        let empty = EmbeddingSpace {
            model: String::new(),
            dimension: 4,
        };
        assert_eq!(pin(Some(empty.clone()), &requested).unwrap(), requested);
        assert!(!is_settled(Some(&empty)));
        assert!(is_settled(Some(&requested)));

        let wider = EmbeddingSpace {
            model: "m".into(),
            dimension: 8,
        };
        assert!(matches!(
            pin(Some(empty), &wider),
            Err(MemoryError::EmbeddingMismatch { .. })
        ));
        let other_model = EmbeddingSpace {
            model: "other".into(),
            dimension: 4,
        };
        assert!(matches!(
            pin(Some(requested), &other_model),
            Err(MemoryError::EmbeddingMismatch { .. })
        ));
    }

    #[test]
    fn test_write_state_follows_newest_point() {
        let mut writes = WriteState {
            sequence: 3,
            last_created_at: 500,
        };

        let mut newest = Fact::new("u", "User likes tea", "");
        newest.sequence = 9;
        newest.created_at = 400;
        writes.observe(&newest);
        assert_eq!(
            writes,
            WriteState {
                sequence: 9,
                last_created_at: 500,
            }
        );

        newest.sequence = 2;
        newest.created_at = 900;
        writes.observe(&newest);
        assert_eq!(
            writes,
            WriteState {
                sequence: 9,
                last_created_at: 900,
            }
        );
    }

    #[test]
    fn test_fact_from_payload() {
        let id = Uuid::new_v4();
        let payload: HashMap<String, Value> = [
            ("scope".to_string(), Value::from("alice".to_string())),
            ("text".to_string(), Value::from("User likes tea".to_string())),
            ("embedding_model".to_string(), Value::from("m".to_string())),
            ("created_at".to_string(), Value::from(42i64)),
            ("sequence".to_string(), Value::from(7i64)),
        ]
        .into_iter()
        .collect();

        let fact = fact_from_payload(point_id(&id), payload).unwrap();
        assert_eq!(fact.id, id);
        assert_eq!(fact.scope, "alice");
        assert_eq!(fact.sequence, 7);
        assert_eq!(fact.source_utterance, "");

        assert!(fact_from_payload(PointId::from(3u64), HashMap::new()).is_none());
    }
}
