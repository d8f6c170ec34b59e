//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the contract every backend satisfies: the
//! [`InMemoryIndex`](memory::InMemoryIndex) here and the durable SQLite
//! index in the app crate. Search is exact (brute force) in both, but the
//! contract does not depend on it.
//!
//! Entries are keyed by `(chunk_id, embedding_model_id)`, so several
//! embedding generations of one chunk coexist during a model migration.
//!
//! # Visibility
//!
//! An entry is returned by [`search`](VectorIndex::search) only when all of
//! the following hold:
//!
//! - it is not tombstoned
//! - its model is active and equals the query's model
//! - its chunk's `content_version` is the version currently published for
//!   its document (see [`publish`](VectorIndex::publish))
//! - it matches the query's [`SearchFilter`]
//!
//! Publication is what makes a document version appear atomically: chunks
//! of an unpublished version can be upserted one by one without ever being
//! seen by a concurrent search.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorIndex::upsert) | Insert or replace one entry (idempotent) |
//! | [`delete`](VectorIndex::delete) | Tombstone every generation of a chunk |
//! | [`delete_by_document`](VectorIndex::delete_by_document) | Tombstone a document and unpublish it |
//! | [`publish`](VectorIndex::publish) | Flip a document to a version, tombstoning the rest |
//! | [`search`](VectorIndex::search) | Top-k by similarity within one model |
//! | [`retire_model`](VectorIndex::retire_model) | Invalidate a generation without deleting it |
//! | [`purge_tombstones`](VectorIndex::purge_tombstones) | Physically drop tombstoned entries |

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, dot_product};
use crate::error::{RagError, Result};
use crate::models::{Chunk, DocumentMetadata, EmbeddingRecord, SearchFilter};

/// Scores closer than this are considered tied.
pub const SCORE_TOLERANCE: f32 = 1e-6;

/// Similarity metric, fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
}

impl Metric {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => dot_product(a, b),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Dot => "dot",
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "dot" => Ok(Metric::Dot),
            other => Err(RagError::invalid(format!(
                "unknown metric '{}' (expected cosine or dot)",
                other
            ))),
        }
    }
}

/// Everything the index stores for one `(chunk, model)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record: EmbeddingRecord,
    pub chunk: Chunk,
    pub document: DocumentMetadata,
}

impl IndexEntry {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }

    pub fn model_id(&self) -> &str {
        &self.record.embedding_model_id
    }
}

/// Inputs to [`VectorIndex::search`].
#[derive(Debug, Clone)]
pub struct SearchQuery<'a> {
    pub vector: &'a [f32],
    /// Only entries embedded by this model are considered.
    pub model_id: &'a str,
    pub k: usize,
    pub filter: Option<&'a SearchFilter>,
}

/// A scored entry returned by [`VectorIndex::search`].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub chunk: Chunk,
    pub document: DocumentMetadata,
}

impl SearchHit {
    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }
}

/// The currently published version of a document and its live chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedDocument {
    pub document_id: String,
    pub content_version: u64,
    pub metadata: DocumentMetadata,
    /// Live chunks in ordinal order.
    pub chunks: Vec<Chunk>,
}

/// Per-model counters reported by [`VectorIndex::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelStats {
    pub model_id: String,
    pub dims: usize,
    pub retired: bool,
    pub entries: usize,
    pub tombstoned: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub metric: Metric,
    pub published_documents: usize,
    pub models: Vec<ModelStats>,
}

/// Storage and k-NN search over embedded chunks.
///
/// Implementations must be `Send + Sync`; all methods take `&self` and
/// must tolerate concurrent callers.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Metric this index was created with.
    fn metric(&self) -> Metric;

    /// Insert or replace the entry for `(chunk_id, model_id)`.
    ///
    /// The first write for a model fixes its dimensionality; later writes
    /// of another length fail with [`RagError::InvalidInput`]. Upserting a
    /// tombstoned entry revives it.
    async fn upsert(&self, entry: IndexEntry) -> Result<()>;

    /// Upsert several entries.
    async fn upsert_many(&self, entries: Vec<IndexEntry>) -> Result<()> {
        for entry in entries {
            self.upsert(entry).await?;
        }
        Ok(())
    }

    /// Tombstone every generation of `chunk_id`. Returns whether anything
    /// live was tombstoned.
    async fn delete(&self, chunk_id: &str) -> Result<bool>;

    /// Tombstone all entries of `document_id` and drop its publication.
    /// Returns the number of distinct chunks tombstoned.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize>;

    /// Make `content_version` the visible version of `document_id` and
    /// tombstone every entry of the document whose chunk id is not in
    /// `live_chunk_ids`. Returns the number of distinct chunks tombstoned.
    ///
    /// Publishing a version lower than the current one is rejected.
    async fn publish(
        &self,
        document_id: &str,
        content_version: u64,
        live_chunk_ids: &[String],
    ) -> Result<usize>;

    /// Version currently visible for `document_id`.
    async fn published_version(&self, document_id: &str) -> Result<Option<u64>>;

    /// Live chunks of the published version, or `None` when unpublished.
    async fn published_document(&self, document_id: &str) -> Result<Option<PublishedDocument>>;

    /// Up to `k` visible entries by descending score, ties broken by
    /// ascending `chunk_id`.
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchHit>>;

    /// Invalidate every entry of `model_id` and refuse further writes to
    /// it. Entries are kept. Returns the number of entries invalidated.
    async fn retire_model(&self, model_id: &str) -> Result<usize>;

    /// Physically remove tombstoned entries. Returns how many were removed.
    async fn purge_tombstones(&self) -> Result<usize>;

    async fn stats(&self) -> Result<IndexStats>;
}

/// Checks shared by every backend before an entry is written.
pub fn validate_entry(entry: &IndexEntry, registered_dims: Option<usize>) -> Result<()> {
    if entry.record.chunk_id != entry.chunk.chunk_id {
        return Err(RagError::invalid(format!(
            "embedding record for '{}' attached to chunk '{}'",
            entry.record.chunk_id, entry.chunk.chunk_id
        )));
    }
    if entry.record.vector.is_empty() {
        return Err(RagError::invalid(format!(
            "empty vector for chunk '{}'",
            entry.chunk.chunk_id
        )));
    }
    if let Some(dims) = registered_dims {
        if entry.record.vector.len() != dims {
            return Err(RagError::invalid(format!(
                "vector for chunk '{}' has {} dims, model '{}' is registered with {}",
                entry.chunk.chunk_id,
                entry.record.vector.len(),
                entry.record.embedding_model_id,
                dims
            )));
        }
    }
    Ok(())
}

/// Checks shared by every backend before a search runs.
pub fn validate_query(query: &SearchQuery<'_>, registered_dims: Option<usize>) -> Result<()> {
    if let Some(dims) = registered_dims {
        if query.vector.len() != dims {
            return Err(RagError::invalid(format!(
                "query vector has {} dims, model '{}' is registered with {}",
                query.vector.len(),
                query.model_id,
                dims
            )));
        }
    }
    Ok(())
}

/// Sort hits by score (desc) then `chunk_id` (asc) and keep the top `k`.
///
/// Ties are windows, not buckets: after sorting by score, each run of hits
/// within [`SCORE_TOLERANCE`] of the run's highest score is reordered by
/// `chunk_id`. Anchoring the window at the run's head keeps the order
/// deterministic; a chain of hits each within tolerance of the next but
/// spanning more than the tolerance overall is split into several runs.
pub fn rank_hits(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
    });

    let mut start = 0;
    while start < hits.len() {
        let head = hits[start].score;
        let end = hits[start..]
            .iter()
            .position(|h| head - h.score > SCORE_TOLERANCE)
            .map_or(hits.len(), |offset| start + offset);
        hits[start..end].sort_by(|a, b| a.chunk.chunk_id.cmp(&b.chunk.chunk_id));
        start = end;
    }

    hits.truncate(k);
    hits
}


#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> SearchHit {
        let mut e = test_support::entry("d", 1, 0, "m", vec![1.0]);
        e.chunk.chunk_id = id.to_string();
        SearchHit {
            score,
            chunk: e.chunk,
            document: e.document,
        }
    }

    #[test]
    fn test_rank_by_score_then_id() {
        let ranked = rank_hits(
            vec![hit("b", 0.5), hit("a", 0.5), hit("c", 0.9), hit("d", 0.1)],
            3,
        );
        let ids: Vec<&str> = ranked.iter().map(|h| h.chunk_id()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_near_ties_use_chunk_id() {
        let ranked = rank_hits(vec![hit("z", 0.700_000_1), hit("y", 0.7)], 2);
        assert_eq!(ranked[0].chunk_id(), "y");
    }

    #[test]
    fn test_ties_straddling_rounding_edge() {
        // 0.5000004 and 0.5000006 round to different millionths.
        let ranked = rank_hits(vec![hit("b", 0.500_000_6), hit("a", 0.500_000_4)], 2);
        assert_eq!(ranked[0].chunk_id(), "a");
    }

    #[test]
    fn test_tie_window_anchored_at_head() {
        let ranked = rank_hits(
            vec![
                hit("c", 0.800_000_0),
                hit("b", 0.799_999_3),
                hit("a", 0.799_998_6),
            ],
            3,
        );
        let ids: Vec<&str> = ranked.iter().map(|h| h.chunk_id()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("dot".parse::<Metric>().unwrap(), Metric::Dot);
        assert!("l2".parse::<Metric>().is_err());
    }

    #[test]
    fn test_metric_scores() {
        assert!((Metric::Cosine.score(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((Metric::Dot.score(&[2.0, 0.0], &[1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate_entry() {
        let e = test_support::entry("d", 1, 0, "m", vec![1.0, 0.0]);
        assert!(validate_entry(&e, None).is_ok());
        assert!(validate_entry(&e, Some(2)).is_ok());
        assert!(matches!(
            validate_entry(&e, Some(3)),
            Err(RagError::InvalidInput(_))
        ));

        let mut mismatched = e.clone();
        mismatched.record.chunk_id = "other".into();
        assert!(validate_entry(&mismatched, None).is_err());

        let mut empty = e;
        empty.record.vector.clear();
        assert!(validate_entry(&empty, None).is_err());
    }
}
