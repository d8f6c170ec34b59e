//! Core data models that flow through ingestion and retrieval.
//!
//! Documents come in from the host application, chunks and embedding
//! records are produced by the pipeline, and [`RetrievalResult`] is what a
//! query hands back.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Source metadata attached to a standard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub published_on: Option<NaiveDate>,
}

/// An ingested standard at a specific content version.
///
/// A document is never mutated in place: new content arrives as a higher
/// `content_version` and supersedes the previous one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub content_version: u64,
    pub text: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

/// A bounded, contiguous span of a document's text.
///
/// `start_offset`/`end_offset` are token positions (half-open) in the
/// document's token stream; `byte_start`/`byte_end` locate the same span in
/// the UTF-8 source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content_version: u64,
    pub ordinal: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub token_count: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A vector produced for one chunk by one embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub embedding_model_id: String,
    pub created_at: DateTime<Utc>,
}

/// Optional restriction applied to a query.
///
/// `document_ids: Some(vec![])` restricts to the empty set and therefore
/// matches nothing; `None` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, document_id: &str, metadata: &DocumentMetadata) -> bool {
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| id == document_id) {
                return false;
            }
        }
        if let Some(org) = &self.organization {
            if metadata.organization.as_deref() != Some(org.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One chunk packed into a [`RetrievalResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// 1-based position in the index ranking.
    pub rank: usize,
    pub score: f32,
    pub document_id: String,
    pub chunk_id: String,
    pub ordinal: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_count: usize,
}

/// Maps one passage of the assembled context back to its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Tag used in the context, e.g. `1` for `[1]`.
    pub label: usize,
    pub document_id: String,
    /// Chunks merged into this passage, in ordinal order.
    pub chunk_ids: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Byte range of the passage text inside `RetrievalResult::context`.
    pub context_start: usize,
    pub context_end: usize,
    /// Token range in the source document.
    pub start_offset: usize,
    pub end_offset: usize,
    /// Byte range in the source document text. The passage reproduces
    /// this slice exactly, except that the whitespace between two merged
    /// chunks that touch without overlapping is rendered as one space.
    pub byte_start: usize,
    pub byte_end: usize,
}

/// The answer to one query: ranked chunks, assembled context, citations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub results: Vec<RetrievedChunk>,
    pub context: String,
    pub citations: Vec<Citation>,
    /// Token count of `context` under the shared tokenizer.
    #[serde(default)]
    pub context_tokens: usize,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Outcome of ingesting one document version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub content_version: u64,
    pub chunks_created: usize,
    pub embeddings_created: usize,
    /// Entries of earlier versions tombstoned by the publish step.
    pub chunks_superseded: usize,
}

/// Outcome of removing a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveReport {
    pub document_id: String,
    pub chunks_removed: usize,
}
