//! Ingestion pipeline: document → chunks → vectors → index → publish.
//!
//! A version becomes searchable only at the final
//! [`publish`](crate::index::VectorIndex::publish) call, after every one of
//! its entries has been upserted. If ingestion fails or is cancelled
//! part-way, the previously published version keeps being served and the
//! orphaned entries stay invisible until the next successful run for that
//! document overwrites them.
//!
//! Operations on the same document are serialised through
//! [`DocumentLocks`]; different documents proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::chunk::{chunk_text, ChunkParams};
use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::{IndexEntry, VectorIndex};
use crate::models::{Chunk, Document, DocumentMetadata, EmbeddingRecord, IngestReport, RemoveReport};

/// Keyed async mutexes, one per document id.
///
/// An entry lives only while some task holds or waits for its lock.
#[derive(Default)]
pub struct DocumentLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held lock for one document; released on drop.
pub struct DocumentGuard<'a> {
    locks: &'a DocumentLocks,
    document_id: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
    _held: tokio::sync::OwnedMutexGuard<()>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, document_id: &str) -> DocumentGuard<'_> {
        let mutex = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(document_id.to_string())
            .or_default()
            .clone();
        let held = mutex.clone().lock_owned().await;
        DocumentGuard {
            locks: self,
            document_id: document_id.to_string(),
            mutex,
            _held: held,
        }
    }

    /// Number of documents with a held or awaited lock.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.locks.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // References: the map, `self.mutex`, and the held guard. Waiters
        // hold their own clone, so anything above three keeps the entry.
        let idle = inner
            .get(&self.document_id)
            .is_some_and(|m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) <= 3);
        if idle {
            inner.remove(&self.document_id);
        }
    }
}

pub struct Ingestor {
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    model_id: String,
    params: ChunkParams,
    locks: DocumentLocks,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<Embedder>,
        index: Arc<dyn VectorIndex>,
        model_id: impl Into<String>,
        params: ChunkParams,
    ) -> Result<Self> {
        params.validate()?;
        let model_id = model_id.into();
        if embedder.dims(&model_id).is_none() {
            return Err(RagError::invalid(format!(
                "no embedding provider registered for model '{}'",
                model_id
            )));
        }
        Ok(Self {
            embedder,
            index,
            model_id,
            params,
            locks: DocumentLocks::new(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn params(&self) -> &ChunkParams {
        &self.params
    }

    /// Chunk, embed, index, and publish one document version.
    ///
    /// Re-ingesting the published version is idempotent. A version lower
    /// than the published one is rejected with [`RagError::InvalidInput`].
    pub async fn ingest(&self, doc: &Document) -> Result<IngestReport> {
        if doc.document_id.trim().is_empty() {
            return Err(RagError::invalid("document_id must not be empty"));
        }

        let _guard = self.locks.lock(&doc.document_id).await;

        let published = self.index.published_version(&doc.document_id).await?;
        if let Some(published) = published {
            if doc.content_version < published {
                return Err(RagError::invalid(format!(
                    "document '{}' version {} is older than published version {}",
                    doc.document_id, doc.content_version, published
                )));
            }
        }

        let chunks = chunk_text(&doc.document_id, doc.content_version, &doc.text, &self.params)?;
        if published == Some(doc.content_version) {
            self.check_unchanged(doc, &chunks).await?;
        }
        tracing::debug!(
            document_id = %doc.document_id,
            content_version = doc.content_version,
            chunks = chunks.len(),
            "chunked document"
        );

        let entries = self.embed_chunks(&chunks, &doc.metadata, &self.model_id).await?;
        let embeddings_created = entries.len();
        self.index.upsert_many(entries).await?;

        let live: Vec<String> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let superseded = self
            .index
            .publish(&doc.document_id, doc.content_version, &live)
            .await?;

        tracing::info!(
            document_id = %doc.document_id,
            content_version = doc.content_version,
            chunks = chunks.len(),
            superseded,
            "document published"
        );

        Ok(IngestReport {
            document_id: doc.document_id.clone(),
            content_version: doc.content_version,
            chunks_created: chunks.len(),
            embeddings_created,
            chunks_superseded: superseded,
        })
    }

    /// Ingest many documents, at most `max_parallel` at a time.
    ///
    /// Results come back in input order; one document failing does not
    /// affect the others.
    pub async fn ingest_all(&self, docs: &[Document], max_parallel: usize) -> Vec<Result<IngestReport>> {
        stream::iter(docs)
            .map(|doc| self.ingest(doc))
            .buffered(max_parallel.max(1))
            .collect()
            .await
    }

    /// Remove every chunk of `document_id` from search.
    pub async fn remove(&self, document_id: &str) -> Result<RemoveReport> {
        let _guard = self.locks.lock(document_id).await;

        let chunks_removed = self.index.delete_by_document(document_id).await?;
        tracing::info!(document_id, chunks_removed, "document removed");

        Ok(RemoveReport {
            document_id: document_id.to_string(),
            chunks_removed,
        })
    }

    /// Embed the published chunks of `document_id` with `target_model`,
    /// adding a new generation next to the existing one.
    ///
    /// Returns the number of embeddings written; an unpublished document
    /// yields zero.
    pub async fn backfill_generation(&self, document_id: &str, target_model: &str) -> Result<usize> {
        let _guard = self.locks.lock(document_id).await;

        let Some(published) = self.index.published_document(document_id).await? else {
            return Ok(0);
        };

        let entries = self
            .embed_chunks(&published.chunks, &published.metadata, target_model)
            .await?;
        let written = entries.len();
        self.index.upsert_many(entries).await?;

        tracing::info!(
            document_id,
            content_version = published.content_version,
            model = target_model,
            written,
            "generation backfilled"
        );
        Ok(written)
    }

    /// A published version is immutable: re-ingesting it must reproduce
    /// the same chunks.
    async fn check_unchanged(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        let stored = self
            .index
            .published_document(&doc.document_id)
            .await?
            .map(|p| p.chunks)
            .unwrap_or_default();
        let same = stored.len() == chunks.len()
            && stored.iter().zip(chunks).all(|(a, b)| a.hash == b.hash);
        if same {
            return Ok(());
        }
        Err(RagError::invalid(format!(
            "document '{}' version {} is already published with different content; \
             ingest the change as a new version",
            doc.document_id, doc.content_version
        )))
    }

    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        metadata: &DocumentMetadata,
        model_id: &str,
    ) -> Result<Vec<IndexEntry>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts, model_id).await?;
        let created_at = Utc::now();

        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry {
                record: EmbeddingRecord {
                    chunk_id: chunk.chunk_id.clone(),
                    vector,
                    embedding_model_id: model_id.to_string(),
                    created_at,
                },
                chunk: chunk.clone(),
                document: metadata.clone(),
            })
            .collect())
    }
}
