//! ============================================================================
//! Fact Store - Persisted facts with embeddings
//! ============================================================================
//! `FactStore` is the port; `RedbFactStore` is the embedded default.
//! Default path: ~/.aicook/memory.redb (override via MEMORY_DB_PATH env var)
//!
//! Tables:
//! - facts:    "{scope}:{sequence:020}" -> bincode FactRecord
//! - ids:      fact uuid -> facts key
//! - meta:     "embedding_space" -> bincode EmbeddingSpace
//! - counters: "sequence" / "last_created_at"
//! ============================================================================

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::canonical::same_polarity;
use super::similarity::{cosine_similarity, rank};
use super::types::{EmbeddingSpace, Fact, FactId, InsertOutcome, ScoredFact, StoreStats};
use crate::types::MemoryError;

const FACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("facts");
const IDS: TableDefinition<&str, &str> = TableDefinition::new("ids");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const COUNTERS: TableDefinition<&str, i64> = TableDefinition::new("counters");

const SPACE_KEY: &str = "embedding_space";
const SEQUENCE_KEY: &str = "sequence";
const LAST_CREATED_KEY: &str = "last_created_at";

/// Facts read per transaction by `all`
const PAGE_SIZE: usize = 64;

/// Persisted collection of facts, partitioned by scope
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Append a fact, or return the id of a near-duplicate already stored.
    /// Atomic: either the whole fact commits or nothing does.
    async fn insert(&self, fact: Fact) -> Result<InsertOutcome, MemoryError>;

    /// Up to `k` facts of `scope` closest to `embedding`, best first
    async fn search(
        &self,
        scope: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredFact>, MemoryError>;

    /// Every fact in `scope`, oldest first, read lazily
    fn all<'a>(&'a self, scope: &'a str) -> BoxStream<'a, Result<Fact, MemoryError>>;

    async fn get(&self, id: &FactId) -> Result<Option<Fact>, MemoryError>;

    /// Delete the given facts of `scope` in one transaction; returns how many existed
    async fn delete(&self, scope: &str, ids: &[FactId]) -> Result<usize, MemoryError>;

    /// Delete every fact of `scope`
    async fn clear(&self, scope: &str) -> Result<usize, MemoryError>;

    async fn count(&self, scope: &str) -> Result<usize, MemoryError>;

    async fn stats(&self) -> Result<StoreStats, MemoryError>;

    /// Model and dimension pinned by the first insert, if any
    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError>;

    async fn health_check(&self) -> bool;
}

/// On-disk form of a fact. Every field is always written, as bincode
/// cannot skip fields.
#[derive(Debug, Serialize, Deserialize)]
struct FactRecord {
    id: Uuid,
    scope: String,
    text: String,
    embedding: Vec<f32>,
    embedding_model: String,
    created_at: i64,
    sequence: u64,
    source_utterance: String,
}

impl From<Fact> for FactRecord {
    fn from(fact: Fact) -> Self {
        Self {
            id: fact.id,
            scope: fact.scope,
            text: fact.text,
            embedding: fact.embedding,
            embedding_model: fact.embedding_model,
            created_at: fact.created_at,
            sequence: fact.sequence,
            source_utterance: fact.source_utterance,
        }
    }
}

impl From<FactRecord> for Fact {
    fn from(record: FactRecord) -> Self {
        Self {
            id: record.id,
            scope: record.scope,
            text: record.text,
            embedding: record.embedding,
            embedding_model: record.embedding_model,
            created_at: record.created_at,
            sequence: record.sequence,
            source_utterance: record.source_utterance,
        }
    }
}

pub(super) fn store_error<E: std::fmt::Display>(
    context: &'static str,
) -> impl FnOnce(E) -> MemoryError {
    move |e| MemoryError::StoreUnavailable(format!("{}: {}", context, e))
}

fn decode(bytes: &[u8]) -> Result<Fact, MemoryError> {
    bincode::deserialize::<FactRecord>(bytes)
        .map(Fact::from)
        .map_err(store_error("Failed to deserialize fact"))
}

fn fact_key(scope: &str, sequence: u64) -> String {
    format!("{}:{:020}", scope, sequence)
}

/// Key range covering `scope`; may also cover scopes that extend it with ':'
fn scope_range(scope: &str) -> (String, String) {
    (format!("{}:", scope), format!("{};", scope))
}

fn key_in_scope(key: &str, scope: &str) -> bool {
    key.strip_prefix(scope)
        .and_then(|rest| rest.strip_prefix(':'))
        .is_some_and(|seq| seq.len() == 20 && seq.bytes().all(|b| b.is_ascii_digit()))
}

/// Embedded fact store backed by a single redb file
pub struct RedbFactStore {
    db: Arc<Database>,
    path: PathBuf,
    dedup_threshold: f32,
}

impl RedbFactStore {
    /// Open (or create) the store at `path`.
    ///
    /// `dedup_threshold` is the cosine similarity at or above which a new
    /// fact collapses into an existing one of the same scope and polarity.
    pub fn open(path: impl AsRef<Path>, dedup_threshold: f32) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(store_error("Failed to create store directory"))?;
        }

        info!("Opening fact store at: {}", path.display());

        let db = Database::create(&path).map_err(store_error("Failed to open database"))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(store_error("Failed to begin write"))?;
        {
            write_txn
                .open_table(FACTS)
                .map_err(store_error("Failed to create facts table"))?;
            write_txn
                .open_table(IDS)
                .map_err(store_error("Failed to create ids table"))?;
            write_txn
                .open_table(META)
                .map_err(store_error("Failed to create meta table"))?;
            write_txn
                .open_table(COUNTERS)
                .map_err(store_error("Failed to create counters table"))?;
        }
        write_txn
            .commit()
            .map_err(store_error("Failed to commit init"))?;

        info!("Fact store ready");

        Ok(Self {
            db: Arc::new(db),
            path,
            dedup_threshold,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run redb work off the async runtime
    async fn blocking<T, F>(&self, work: F) -> Result<T, MemoryError>
    where
        F: FnOnce(&Database) -> Result<T, MemoryError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || work(&db))
            .await
            .map_err(store_error("Store task failed"))?
    }
}

fn read_space(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Option<EmbeddingSpace>, MemoryError> {
    match table
        .get(SPACE_KEY)
        .map_err(store_error("Failed to read embedding space"))?
    {
        Some(value) => bincode::deserialize(value.value())
            .map(Some)
            .map_err(store_error("Failed to deserialize embedding space")),
        None => Ok(None),
    }
}

fn read_counter(
    table: &impl ReadableTable<&'static str, i64>,
    key: &str,
) -> Result<i64, MemoryError> {
    Ok(table
        .get(key)
        .map_err(store_error("Failed to read counter"))?
        .map(|v| v.value())
        .unwrap_or(0))
}

/// Closest same-polarity fact of `scope` at or above `threshold`
fn find_duplicate(
    facts: &impl ReadableTable<&'static str, &'static [u8]>,
    fact: &Fact,
    threshold: f32,
) -> Result<Option<(FactId, f32)>, MemoryError> {
    let (start, end) = scope_range(&fact.scope);
    let mut best: Option<(FactId, f32)> = None;

    let iter = facts
        .range::<&str>(start.as_str()..end.as_str())
        .map_err(store_error("Failed to iterate facts"))?;
    for entry in iter {
        let (key, value) = entry.map_err(store_error("Failed to read entry"))?;
        if !key_in_scope(key.value(), &fact.scope) {
            continue;
        }
        let existing = decode(value.value())?;
        let score = cosine_similarity(&existing.embedding, &fact.embedding);
        if score >= threshold
            && same_polarity(&existing.text, &fact.text)
            && best.map_or(true, |(_, s)| score > s)
        {
            best = Some((existing.id, score));
        }
    }
    Ok(best)
}

#[async_trait]
impl FactStore for RedbFactStore {
    async fn insert(&self, fact: Fact) -> Result<InsertOutcome, MemoryError> {
        if fact.embedding.is_empty() || fact.embedding_model.is_empty() {
            return Err(MemoryError::StoreUnavailable(
                "Cannot store fact without embedding".into(),
            ));
        }
        let threshold = self.dedup_threshold;

        self.blocking(move |db| {
            let mut fact = fact;
            let space = EmbeddingSpace::of(&fact);

            let write_txn = db
                .begin_write()
                .map_err(store_error("Failed to begin write"))?;
            {
                let mut meta = write_txn
                    .open_table(META)
                    .map_err(store_error("Failed to open meta table"))?;
                match read_space(&meta)? {
                    Some(pinned) => pinned.ensure_matches(&space)?,
                    None => {
                        let bytes = bincode::serialize(&space)
                            .map_err(store_error("Failed to serialize embedding space"))?;
                        meta.insert(SPACE_KEY, bytes.as_slice())
                            .map_err(store_error("Failed to pin embedding space"))?;
                        info!("Pinned fact store to embedding space {}", space);
                    }
                }
            }

            let duplicate = {
                let facts = write_txn
                    .open_table(FACTS)
                    .map_err(store_error("Failed to open facts table"))?;
                find_duplicate(&facts, &fact, threshold)?
            };
            if let Some((existing, score)) = duplicate {
                write_txn
                    .abort()
                    .map_err(store_error("Failed to abort write"))?;
                debug!(
                    "Skipped near-duplicate of {} (score {:.3}): {}",
                    existing, score, fact.text
                );
                return Ok(InsertOutcome::Duplicate(existing));
            }

            {
                let mut counters = write_txn
                    .open_table(COUNTERS)
                    .map_err(store_error("Failed to open counters table"))?;
                let sequence = read_counter(&counters, SEQUENCE_KEY)? + 1;
                let last_created = read_counter(&counters, LAST_CREATED_KEY)?;
                fact.sequence = sequence as u64;
                fact.created_at = fact.created_at.max(last_created);
                counters
                    .insert(SEQUENCE_KEY, sequence)
                    .map_err(store_error("Failed to update sequence"))?;
                counters
                    .insert(LAST_CREATED_KEY, fact.created_at)
                    .map_err(store_error("Failed to update timestamp"))?;
            }

            let id = fact.id;
            let key = fact_key(&fact.scope, fact.sequence);
            let text = fact.text.clone();
            let value = bincode::serialize(&FactRecord::from(fact))
                .map_err(store_error("Failed to serialize fact"))?;
            {
                let mut facts = write_txn
                    .open_table(FACTS)
                    .map_err(store_error("Failed to open facts table"))?;
                facts
                    .insert(key.as_str(), value.as_slice())
                    .map_err(store_error("Failed to insert fact"))?;

                let mut ids = write_txn
                    .open_table(IDS)
                    .map_err(store_error("Failed to open ids table"))?;
                let id_str = id.to_string();
                ids.insert(id_str.as_str(), key.as_str())
                    .map_err(store_error("Failed to index fact"))?;
            }
            write_txn
                .commit()
                .map_err(store_error("Failed to commit"))?;

            info!("Stored fact {}: {}", id, text);
            Ok(InsertOutcome::Inserted(id))
        })
        .await
    }

    async fn search(
        &self,
        scope: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredFact>, MemoryError> {
        if k == 0 {
            return Ok(vec![]);
        }
        let scope = scope.to_string();
        let query = embedding.to_vec();

        self.blocking(move |db| {
            let read_txn = db
                .begin_read()
                .map_err(store_error("Failed to begin read"))?;
            let meta = read_txn
                .open_table(META)
                .map_err(store_error("Failed to open meta table"))?;
            match read_space(&meta)? {
                Some(pinned) => pinned.ensure_dimension(query.len())?,
                // Nothing was ever stored
                None => return Ok(vec![]),
            }

            let facts = read_txn
                .open_table(FACTS)
                .map_err(store_error("Failed to open facts table"))?;
            let (start, end) = scope_range(&scope);
            let mut results = Vec::new();
            let iter = facts
                .range::<&str>(start.as_str()..end.as_str())
                .map_err(store_error("Failed to iterate facts"))?;
            for entry in iter {
                let (key, value) = entry.map_err(store_error("Failed to read entry"))?;
                if !key_in_scope(key.value(), &scope) {
                    continue;
                }
                let fact = decode(value.value())?;
                let score = cosine_similarity(&fact.embedding, &query);
                results.push(ScoredFact { fact, score });
            }

            rank(&mut results);
            results.truncate(k);
            debug!("Found {} candidate facts for scope {}", results.len(), scope);
            Ok(results)
        })
        .await
    }

    fn all<'a>(&'a self, scope: &'a str) -> BoxStream<'a, Result<Fact, MemoryError>> {
        let db = self.db.clone();
        let scope = scope.to_string();
        let (start, _) = scope_range(&scope);

        stream::try_unfold(Some(start), move |cursor| {
            let db = db.clone();
            let scope = scope.clone();
            async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, MemoryError>(None);
                };
                let page = tokio::task::spawn_blocking(move || read_page(&db, &scope, &cursor))
                    .await
                    .map_err(store_error("Store task failed"))??;
                Ok(Some(page))
            }
        })
        .map_ok(|facts: Vec<Fact>| stream::iter(facts.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn get(&self, id: &FactId) -> Result<Option<Fact>, MemoryError> {
        let id = id.to_string();
        self.blocking(move |db| {
            let read_txn = db
                .begin_read()
                .map_err(store_error("Failed to begin read"))?;
            let ids = read_txn
                .open_table(IDS)
                .map_err(store_error("Failed to open ids table"))?;
            let Some(key) = ids
                .get(id.as_str())
                .map_err(store_error("Failed to get fact id"))?
            else {
                return Ok(None);
            };

            let facts = read_txn
                .open_table(FACTS)
                .map_err(store_error("Failed to open facts table"))?;
            let value = facts
                .get(key.value())
                .map_err(store_error("Failed to get fact"))?;
            value.map(|v| decode(v.value())).transpose()
        })
        .await
    }

    async fn delete(&self, scope: &str, ids: &[FactId]) -> Result<usize, MemoryError> {
        let scope = scope.to_string();
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();

        self.blocking(move |db| {
            let write_txn = db
                .begin_write()
                .map_err(store_error("Failed to begin write"))?;
            let mut removed = 0;
            {
                let mut id_table = write_txn
                    .open_table(IDS)
                    .map_err(store_error("Failed to open ids table"))?;
                let mut facts = write_txn
                    .open_table(FACTS)
                    .map_err(store_error("Failed to open facts table"))?;

                for id in &ids {
                    let key = match id_table
                        .get(id.as_str())
                        .map_err(store_error("Failed to get fact id"))?
                    {
                        Some(key) => key.value().to_string(),
                        None => continue,
                    };
                    if !key_in_scope(&key, &scope) {
                        continue;
                    }
                    facts
                        .remove(key.as_str())
                        .map_err(store_error("Failed to remove fact"))?;
                    id_table
                        .remove(id.as_str())
                        .map_err(store_error("Failed to remove fact id"))?;
                    removed += 1;
                }
            }
            write_txn
                .commit()
                .map_err(store_error("Failed to commit delete"))?;

            if removed > 0 {
                info!("Deleted {} facts from scope {}", removed, scope);
            }
            Ok(removed)
        })
        .await
    }

    async fn clear(&self, scope: &str) -> Result<usize, MemoryError> {
        let scope = scope.to_string();

        self.blocking(move |db| {
            let write_txn = db
                .begin_write()
                .map_err(store_error("Failed to begin write"))?;
            let removed;
            {
                let mut facts = write_txn
                    .open_table(FACTS)
                    .map_err(store_error("Failed to open facts table"))?;
                let mut ids = write_txn
                    .open_table(IDS)
                    .map_err(store_error("Failed to open ids table"))?;

                let (start, end) = scope_range(&scope);
                let mut doomed = Vec::new();
                let iter = facts
                    .range::<&str>(start.as_str()..end.as_str())
                    .map_err(store_error("Failed to iterate facts"))?;
                for entry in iter {
                    let (key, value) = entry.map_err(store_error("Failed to read entry"))?;
                    if key_in_scope(key.value(), &scope) {
                        doomed.push((key.value().to_string(), decode(value.value())?.id));
                    }
                }

                for (key, id) in &doomed {
                    facts
                        .remove(key.as_str())
                        .map_err(store_error("Failed to remove fact"))?;
                    ids.remove(id.to_string().as_str())
                        .map_err(store_error("Failed to remove fact id"))?;
                }
                removed = doomed.len();
            }
            write_txn
                .commit()
                .map_err(store_error("Failed to commit clear"))?;

            info!("Cleared {} facts from scope {}", removed, scope);
            Ok(removed)
        })
        .await
    }

    async fn count(&self, scope: &str) -> Result<usize, MemoryError> {
        let scope = scope.to_string();
        self.blocking(move |db| {
            let read_txn = db
                .begin_read()
                .map_err(store_error("Failed to begin read"))?;
            let facts = read_txn
                .open_table(FACTS)
                .map_err(store_error("Failed to open facts table"))?;

            let (start, end) = scope_range(&scope);
            let mut count = 0;
            let iter = facts
                .range::<&str>(start.as_str()..end.as_str())
                .map_err(store_error("Failed to iterate facts"))?;
            for entry in iter {
                let (key, _) = entry.map_err(store_error("Failed to read entry"))?;
                if key_in_scope(key.value(), &scope) {
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, MemoryError> {
        let location = self.path.display().to_string();
        self.blocking(move |db| {
            let read_txn = db
                .begin_read()
                .map_err(store_error("Failed to begin read"))?;
            let facts = read_txn
                .open_table(FACTS)
                .map_err(store_error("Failed to open facts table"))?;
            let meta = read_txn
                .open_table(META)
                .map_err(store_error("Failed to open meta table"))?;

            Ok(StoreStats {
                backend: "redb",
                location,
                total_facts: facts.len().map_err(store_error("Failed to count facts"))?,
                embedding_space: read_space(&meta)?,
            })
        })
        .await
    }

    async fn embedding_space(&self) -> Result<Option<EmbeddingSpace>, MemoryError> {
        self.blocking(|db| {
            let read_txn = db
                .begin_read()
                .map_err(store_error("Failed to begin read"))?;
            let meta = read_txn
                .open_table(META)
                .map_err(store_error("Failed to open meta table"))?;
            read_space(&meta)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.blocking(|db| {
            db.begin_read()
                .map(|_| ())
                .map_err(store_error("Failed to begin read"))
        })
        .await
        .is_ok()
    }
}

/// One page of `scope` starting at `cursor`, plus the next cursor if more remain
fn read_page(
    db: &Database,
    scope: &str,
    cursor: &str,
) -> Result<(Vec<Fact>, Option<String>), MemoryError> {
    let read_txn = db
        .begin_read()
        .map_err(store_error("Failed to begin read"))?;
    let facts = read_txn
        .open_table(FACTS)
        .map_err(store_error("Failed to open facts table"))?;

    let (_, end) = scope_range(scope);
    let mut page = Vec::new();
    let mut last_key = None;
    let mut scanned = 0;

    let iter = facts
        .range::<&str>(cursor..end.as_str())
        .map_err(store_error("Failed to iterate facts"))?;
    for entry in iter.take(PAGE_SIZE) {
        let (key, value) = entry.map_err(store_error("Failed to read entry"))?;
        scanned += 1;
        if key_in_scope(key.value(), scope) {
            page.push(decode(value.value())?);
        }
        last_key = Some(key.value().to_string());
    }

    // "\0" sorts directly after the last key read
    let next = match last_key {
        Some(key) if scanned == PAGE_SIZE => Some(format!("{}\0", key)),
        _ => None,
    };
    Ok((page, next))
}
