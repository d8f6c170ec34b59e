//! # Standards Search
//!
//! Retrieval-augmented search over technical standards: documents are
//! chunked, embedded, and stored in a durable SQLite vector index; queries
//! return ranked chunks, a token-bounded context, and citations back to
//! the source spans.
//!
//! The pipeline itself (tokenizer, chunker, embedder, index trait,
//! retrieval orchestrator) lives in `standards-search-core`. This crate
//! supplies the pieces around it:
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────┐
//! │  CLI (sts)   │──▶│      Engine      │──▶│ SqliteIndex │
//! │  HTTP server │   │ ingest / search  │   │  + catalog  │
//! └──────────────┘   └────────┬─────────┘   └─────────────┘
//!                             ▼
//!                  ┌──────────────────────┐
//!                  │ Embedding/generation │
//!                  │ providers (HTTP/ORT) │
//!                  └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_index`] | Durable [`VectorIndex`](standards_search_core::index::VectorIndex) |
//! | [`catalog`] | Latest text and metadata per document |
//! | [`embedding`] | OpenAI, Ollama, hashing, and local providers |
//! | [`generation`] | Chat-completion provider for `ask` |
//! | [`engine`] | Wiring of the pipeline for one process |
//! | [`server`] | HTTP API |
//! | [`logging`] | tracing subscriber setup |

pub mod catalog;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine;
pub mod generation;
pub mod get;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod search;
pub mod server;
pub mod sqlite_index;
pub mod stats;
