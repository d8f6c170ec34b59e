//! # Standards Search Core
//!
//! Runtime-agnostic retrieval logic for Standards Search: data models,
//! the shared tokenizer, the overlapping chunker, the batching
//! [`Embedder`](embedding::Embedder), the [`VectorIndex`](index::VectorIndex)
//! contract with an in-memory implementation, the retrieval orchestrator,
//! and the ingestion pipeline.
//!
//! This crate contains no sqlx, HTTP, or filesystem code. Durable storage
//! and concrete providers live in the `standards-search` app crate.
//!
//! ```text
//!  ingest:  Document ─▶ chunk ─▶ Embedder ─▶ VectorIndex::upsert ─▶ publish
//!  query:   text ─▶ Embedder ─▶ VectorIndex::search ─▶ merge ─▶ pack ─▶ RetrievalResult
//! ```

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod models;
pub mod retrieve;
pub mod tokenize;

pub use error::{ErrorKind, ProviderError, RagError, Result};
