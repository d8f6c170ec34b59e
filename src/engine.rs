//! Process-wide wiring of the retrieval pipeline.
//!
//! [`Engine::open`] builds everything a command or the HTTP server needs
//! from a [`Config`]: the SQLite pool and schema, the verified
//! [`SqliteIndex`], the [`Embedder`] with the active model (and the
//! `embedding_next` model during a migration), the [`Ingestor`], the
//! [`Retriever`], and the optional generation provider.
//!
//! The engine also keeps the document catalog in step with the index:
//! successful ingests are recorded there and removals drop the row. Version
//! resolution, ingest, and the catalog write for one document run under a
//! single per-document lock, so concurrent submissions of the same document
//! get distinct versions.

use std::sync::Arc;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use standards_search_core::embedding::Embedder;
use standards_search_core::generation::{self, Answer, GenerationProvider};
use standards_search_core::index::{IndexStats, VectorIndex};
use standards_search_core::ingest::{DocumentLocks, Ingestor};
use standards_search_core::models::{
    Chunk, Document, DocumentMetadata, IngestReport, RemoveReport, RetrievalResult, SearchFilter,
};
use standards_search_core::retrieve::Retriever;
use standards_search_core::{RagError, Result};

use crate::catalog;
use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::generation::create_generator;
use crate::migrate;
use crate::sqlite_index::SqliteIndex;

/// A document submitted for ingestion. Without `content_version` the
/// catalog assigns one.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub document_id: String,
    #[serde(default)]
    pub content_version: Option<u64>,
    pub text: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

/// A catalogued document with its published chunks.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub document_id: String,
    pub content_version: u64,
    pub published_version: Option<u64>,
    pub metadata: DocumentMetadata,
    pub body: String,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub model_id: String,
    pub documents: usize,
    pub embeddings: usize,
}

pub struct Engine {
    config: Arc<Config>,
    pool: SqlitePool,
    index: Arc<SqliteIndex>,
    ingestor: Ingestor,
    retriever: Retriever,
    generator: Option<Arc<dyn GenerationProvider>>,
    next_model: Option<String>,
    locks: DocumentLocks,
}

impl Engine {
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;

        let provider = create_provider(&config.embedding)?;
        let model_id = provider.model_name().to_string();
        let mut embedder = Embedder::new(config.embedding.embedder_options());
        embedder.register(provider)?;

        let next_model = match &config.embedding_next {
            Some(next) => {
                let provider = create_provider(next).context("embedding_next")?;
                let name = provider.model_name().to_string();
                if name == model_id {
                    anyhow::bail!("embedding_next must name a different model than embedding");
                }
                embedder.register(provider)?;
                Some(name)
            }
            None => None,
        };
        let embedder = Arc::new(embedder);

        let index = Arc::new(
            SqliteIndex::open(pool.clone(), config.index.metric)
                .await
                .with_context(|| format!("Failed to open index at {}", config.db.path.display()))?,
        );
        let dyn_index: Arc<dyn VectorIndex> = index.clone();

        let ingestor = Ingestor::new(
            embedder.clone(),
            dyn_index.clone(),
            model_id.clone(),
            config.chunking.params(),
        )?;
        let retriever = Retriever::new(embedder, dyn_index, model_id, config.retrieval.options())?;
        let generator = create_generator(&config.generation)?;

        tracing::debug!(
            db = %config.db.path.display(),
            model = ingestor.model_id(),
            next_model = next_model.as_deref(),
            "engine ready"
        );

        Ok(Self {
            config: Arc::new(config.clone()),
            pool,
            index,
            ingestor,
            retriever,
            generator,
            next_model,
            locks: DocumentLocks::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn model_id(&self) -> &str {
        self.ingestor.model_id()
    }

    pub fn next_model_id(&self) -> Option<&str> {
        self.next_model.as_deref()
    }

    async fn resolve(&self, doc: NewDocument) -> Result<Document> {
        let content_version = match doc.content_version {
            Some(v) => v,
            None => catalog::next_version(&self.pool, &doc.document_id, &doc.text).await?,
        };
        Ok(Document {
            document_id: doc.document_id,
            content_version,
            text: doc.text,
            metadata: doc.metadata,
        })
    }

    pub async fn ingest(&self, doc: NewDocument) -> Result<IngestReport> {
        let _guard = self.locks.lock(&doc.document_id).await;
        let doc = self.resolve(doc).await?;
        let report = self.ingestor.ingest(&doc).await?;
        catalog::upsert(&self.pool, &doc).await?;
        Ok(report)
    }

    /// Ingest documents concurrently, bounded by
    /// `ingest.max_parallel_documents`. Results are in input order.
    pub async fn ingest_many(&self, docs: Vec<NewDocument>) -> Vec<Result<IngestReport>> {
        stream::iter(docs)
            .map(|doc| self.ingest(doc))
            .buffered(self.config.ingest.max_parallel_documents.max(1))
            .collect()
            .await
    }

    pub async fn remove(&self, document_id: &str) -> Result<RemoveReport> {
        let _guard = self.locks.lock(document_id).await;
        let report = self.ingestor.remove(document_id).await?;
        catalog::delete(&self.pool, document_id).await?;
        Ok(report)
    }

    pub async fn search(
        &self,
        query: &str,
        k: Option<usize>,
        max_context_tokens: Option<usize>,
        filter: Option<&SearchFilter>,
    ) -> Result<RetrievalResult> {
        self.retriever
            .retrieve(
                query,
                k.unwrap_or(self.config.retrieval.default_k),
                max_context_tokens.unwrap_or(self.config.retrieval.max_context_tokens),
                filter,
            )
            .await
    }

    pub async fn ask(
        &self,
        query: &str,
        k: Option<usize>,
        max_context_tokens: Option<usize>,
        filter: Option<&SearchFilter>,
    ) -> Result<Answer> {
        let Some(generator) = &self.generator else {
            return Err(RagError::invalid(
                "generation is disabled; set [generation] provider in the config",
            ));
        };
        generation::answer(
            &self.retriever,
            generator.as_ref(),
            query,
            k.unwrap_or(self.config.retrieval.default_k),
            max_context_tokens.unwrap_or(self.config.retrieval.max_context_tokens),
            filter,
        )
        .await
    }

    pub async fn get(&self, document_id: &str) -> Result<Option<DocumentView>> {
        let Some(entry) = catalog::get(&self.pool, document_id).await? else {
            return Ok(None);
        };
        let published = self.index.published_document(document_id).await?;
        Ok(Some(DocumentView {
            document_id: entry.id,
            content_version: entry.content_version,
            published_version: published.as_ref().map(|p| p.content_version),
            metadata: entry.metadata,
            body: entry.body,
            chunks: published.map(|p| p.chunks).unwrap_or_default(),
        }))
    }

    /// Embed every published document with the `embedding_next` model.
    pub async fn backfill(&self) -> Result<BackfillReport> {
        let Some(target) = self.next_model.clone() else {
            return Err(RagError::invalid(
                "no [embedding_next] model configured to backfill",
            ));
        };

        let mut documents = 0;
        let mut embeddings = 0;
        for id in catalog::list_ids(&self.pool).await? {
            let written = self.ingestor.backfill_generation(&id, &target).await?;
            if written > 0 {
                documents += 1;
                embeddings += written;
            }
        }
        Ok(BackfillReport {
            model_id: target,
            documents,
            embeddings,
        })
    }

    /// Stop serving `model_id`. The active model cannot be retired.
    pub async fn retire(&self, model_id: &str) -> Result<usize> {
        if model_id == self.model_id() {
            return Err(RagError::invalid(format!(
                "'{}' is the active embedding model; switch [embedding] first",
                model_id
            )));
        }
        let entries = self.index.retire_model(model_id).await?;
        tracing::info!(model = model_id, entries, "embedding model retired");
        Ok(entries)
    }

    /// Physically delete tombstoned entries.
    pub async fn vacuum(&self) -> Result<usize> {
        let purged = self.index.purge_tombstones().await?;
        tracing::info!(purged, "tombstones purged");
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.index.stats().await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
