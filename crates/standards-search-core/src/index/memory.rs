//! In-memory [`VectorIndex`] for tests and embedding in other processes.
//!
//! Entries live in sixteen `RwLock<HashMap>` shards keyed by chunk id, so
//! writers touching different chunks rarely contend. Search is brute force.
//!
//! Lock order is publications → models → shards. Search holds the
//! publications read lock for its whole scan, and `publish` /
//! `delete_by_document` hold the write lock while tombstoning, so a search
//! observes a document either entirely before or entirely after a flip.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{
    rank_hits, validate_entry, validate_query, IndexEntry, IndexStats, Metric, ModelStats,
    PublishedDocument, SearchHit, SearchQuery, VectorIndex,
};
use crate::error::{RagError, Result};

const SHARDS: usize = 16;

/// `(chunk_id, model_id)`
type EntryKey = (String, String);

struct Slot {
    entry: Arc<IndexEntry>,
    tombstoned: bool,
}

#[derive(Debug, Clone, Copy)]
struct ModelState {
    dims: usize,
    retired: bool,
}

pub struct InMemoryIndex {
    metric: Metric,
    shards: Vec<RwLock<HashMap<EntryKey, Slot>>>,
    models: RwLock<HashMap<String, ModelState>>,
    publications: RwLock<HashMap<String, u64>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryIndex {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            models: RwLock::new(HashMap::new()),
            publications: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, chunk_id: &str) -> &RwLock<HashMap<EntryKey, Slot>> {
        let mut hasher = DefaultHasher::new();
        chunk_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Tombstone live entries of `document_id` that fail `keep`. Returns
    /// the distinct chunk ids affected.
    fn tombstone_document(&self, document_id: &str, keep: impl Fn(&str) -> bool) -> HashSet<String> {
        let mut affected = HashSet::new();
        for shard in &self.shards {
            let mut shard = write(shard);
            for slot in shard.values_mut() {
                if slot.tombstoned
                    || slot.entry.chunk.document_id != document_id
                    || keep(slot.entry.chunk_id())
                {
                    continue;
                }
                slot.tombstoned = true;
                affected.insert(slot.entry.chunk.chunk_id.clone());
            }
        }
        affected
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new(Metric::Cosine)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn metric(&self) -> Metric {
        self.metric
    }

    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        {
            let mut models = write(&self.models);
            let state = models.get(entry.model_id()).copied();
            if state.is_some_and(|s| s.retired) {
                return Err(RagError::invalid(format!(
                    "embedding model '{}' is retired",
                    entry.model_id()
                )));
            }
            validate_entry(&entry, state.map(|s| s.dims))?;
            if state.is_none() {
                models.insert(
                    entry.model_id().to_string(),
                    ModelState {
                        dims: entry.record.vector.len(),
                        retired: false,
                    },
                );
            }
        }

        let key = (entry.chunk_id().to_string(), entry.model_id().to_string());
        write(self.shard(&key.0)).insert(
            key,
            Slot {
                entry: Arc::new(entry),
                tombstoned: false,
            },
        );
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<bool> {
        let mut shard = write(self.shard(chunk_id));
        let mut any = false;
        for ((id, _), slot) in shard.iter_mut() {
            if id == chunk_id && !slot.tombstoned {
                slot.tombstoned = true;
                any = true;
            }
        }
        Ok(any)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let mut publications = write(&self.publications);
        publications.remove(document_id);
        Ok(self.tombstone_document(document_id, |_| false).len())
    }

    async fn publish(
        &self,
        document_id: &str,
        content_version: u64,
        live_chunk_ids: &[String],
    ) -> Result<usize> {
        let mut publications = write(&self.publications);
        if let Some(&current) = publications.get(document_id) {
            if content_version < current {
                return Err(RagError::invalid(format!(
                    "document '{}' is already published at version {}, refusing version {}",
                    document_id, current, content_version
                )));
            }
        }
        publications.insert(document_id.to_string(), content_version);

        let live: HashSet<&str> = live_chunk_ids.iter().map(String::as_str).collect();
        Ok(self
            .tombstone_document(document_id, |id| live.contains(id))
            .len())
    }

    async fn published_version(&self, document_id: &str) -> Result<Option<u64>> {
        Ok(read(&self.publications).get(document_id).copied())
    }

    async fn published_document(&self, document_id: &str) -> Result<Option<PublishedDocument>> {
        let publications = read(&self.publications);
        let Some(&version) = publications.get(document_id) else {
            return Ok(None);
        };

        // One entry per chunk regardless of how many generations exist.
        let mut by_ordinal: BTreeMap<usize, Arc<IndexEntry>> = BTreeMap::new();
        for shard in &self.shards {
            for slot in read(shard).values() {
                let chunk = &slot.entry.chunk;
                if !slot.tombstoned
                    && chunk.document_id == document_id
                    && chunk.content_version == version
                {
                    by_ordinal
                        .entry(chunk.ordinal)
                        .or_insert_with(|| slot.entry.clone());
                }
            }
        }

        let metadata = by_ordinal
            .values()
            .next()
            .map(|e| e.document.clone())
            .unwrap_or_default();
        Ok(Some(PublishedDocument {
            document_id: document_id.to_string(),
            content_version: version,
            metadata,
            chunks: by_ordinal.into_values().map(|e| e.chunk.clone()).collect(),
        }))
    }

    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        let publications = read(&self.publications);
        let state = read(&self.models).get(query.model_id).copied();
        let Some(state) = state else {
            return Ok(Vec::new());
        };
        validate_query(query, Some(state.dims))?;
        if state.retired {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for shard in &self.shards {
            for ((_, model_id), slot) in read(shard).iter() {
                if slot.tombstoned || model_id != query.model_id {
                    continue;
                }
                let entry = &slot.entry;
                if publications.get(&entry.chunk.document_id) != Some(&entry.chunk.content_version) {
                    continue;
                }
                if let Some(filter) = query.filter {
                    if !filter.matches(&entry.chunk.document_id, &entry.document) {
                        continue;
                    }
                }
                hits.push(SearchHit {
                    score: self.metric.score(query.vector, &entry.record.vector),
                    chunk: entry.chunk.clone(),
                    document: entry.document.clone(),
                });
            }
        }

        Ok(rank_hits(hits, query.k))
    }

    async fn retire_model(&self, model_id: &str) -> Result<usize> {
        let mut models = write(&self.models);
        let Some(state) = models.get_mut(model_id) else {
            return Err(RagError::invalid(format!(
                "unknown embedding model '{}'",
                model_id
            )));
        };
        state.retired = true;

        let mut count = 0;
        for shard in &self.shards {
            count += read(shard).keys().filter(|(_, m)| m == model_id).count();
        }
        Ok(count)
    }

    async fn purge_tombstones(&self) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = write(shard);
            let before = shard.len();
            shard.retain(|_, slot| !slot.tombstoned);
            removed += before - shard.len();
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats> {
        let publications = read(&self.publications);
        let models = read(&self.models);

        let mut per_model: BTreeMap<&str, ModelStats> = models
            .iter()
            .map(|(id, state)| {
                (
                    id.as_str(),
                    ModelStats {
                        model_id: id.clone(),
                        dims: state.dims,
                        retired: state.retired,
                        ..Default::default()
                    },
                )
            })
            .collect();

        for shard in &self.shards {
            for ((_, model_id), slot) in read(shard).iter() {
                if let Some(stats) = per_model.get_mut(model_id.as_str()) {
                    stats.entries += 1;
                    if slot.tombstoned {
                        stats.tombstoned += 1;
                    }
                }
            }
        }

        Ok(IndexStats {
            metric: self.metric,
            published_documents: publications.len(),
            models: per_model.into_values().collect(),
        })
    }
}
