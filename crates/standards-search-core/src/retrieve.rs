//! Retrieval orchestrator.
//!
//! Turns a query into a [`RetrievalResult`] in five steps:
//!
//! 1. Embed the query with the served model.
//! 2. Search the index for `k' = max(k, k × overfetch_factor)` candidates,
//!    dropping any at or below `min_score`.
//! 3. Merge candidates of the same document whose ordinals are within
//!    `adjacency_window` and whose spans overlap or touch into one passage,
//!    then keep the `k` best-ranked passages. Overlapping spans are
//!    spliced from chunk text; touching spans are joined with one space.
//! 4. Pack passages in rank order while the rendered context fits
//!    `max_context_tokens`; the first passage that does not fit ends
//!    packing. Passages are never truncated.
//! 5. Emit one [`Citation`] per packed passage.
//!
//! Each packed passage is rendered as `[label] text` and passages are
//! separated by a blank line. No generation call happens here; see
//! [`generation`](crate::generation).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::index::{SearchHit, SearchQuery, VectorIndex};
use crate::models::{Citation, RetrievalResult, RetrievedChunk, SearchFilter};
use crate::tokenize::count_tokens;

const PASSAGE_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub overfetch_factor: usize,
    /// Largest ordinal distance at which chunks of one document merge.
    /// Zero disables merging.
    pub adjacency_window: usize,
    /// Candidates scoring at or below this are discarded.
    pub min_score: Option<f32>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            overfetch_factor: 3,
            adjacency_window: 1,
            min_score: None,
        }
    }
}

pub struct Retriever {
    embedder: Arc<Embedder>,
    index: Arc<dyn VectorIndex>,
    model_id: String,
    options: RetrievalOptions,
}

/// A run of merged chunks from one document.
#[derive(Debug)]
struct Passage {
    document_id: String,
    title: Option<String>,
    /// `(rank, hit)` in ordinal order.
    members: Vec<(usize, SearchHit)>,
    text: String,
    start_offset: usize,
    end_offset: usize,
    byte_start: usize,
    byte_end: usize,
}

impl Passage {
    fn new(rank: usize, hit: SearchHit) -> Self {
        Self {
            document_id: hit.chunk.document_id.clone(),
            title: hit.document.title.clone(),
            text: hit.chunk.text.clone(),
            start_offset: hit.chunk.start_offset,
            end_offset: hit.chunk.end_offset,
            byte_start: hit.chunk.byte_start,
            byte_end: hit.chunk.byte_end,
            members: vec![(rank, hit)],
        }
    }

    fn best_rank(&self) -> usize {
        self.members.iter().map(|(r, _)| *r).min().unwrap_or(usize::MAX)
    }

    fn last_ordinal(&self) -> usize {
        self.members.last().map(|(_, h)| h.chunk.ordinal).unwrap_or(0)
    }

    /// Whether `hit` (with a larger ordinal) continues this passage.
    fn accepts(&self, hit: &SearchHit, window: usize) -> bool {
        hit.chunk.ordinal - self.last_ordinal() <= window && hit.chunk.start_offset <= self.end_offset
    }

    /// Append `hit`, splicing its text so the overlap appears once.
    ///
    /// Chunks never hold the whitespace between them, so a chunk that
    /// starts exactly where the passage ends is joined with a single space.
    fn extend(&mut self, rank: usize, hit: SearchHit) {
        let chunk = &hit.chunk;
        if chunk.end_offset > self.end_offset {
            if chunk.start_offset == self.end_offset {
                self.text.push(' ');
                self.text.push_str(&chunk.text);
            } else {
                let from = self.byte_end - chunk.byte_start;
                self.text.push_str(&chunk.text[from..]);
            }
            self.end_offset = chunk.end_offset;
            self.byte_end = chunk.byte_end;
        }
        self.members.push((rank, hit));
    }
}

impl Retriever {
    pub fn new(
        embedder: Arc<Embedder>,
        index: Arc<dyn VectorIndex>,
        model_id: impl Into<String>,
        options: RetrievalOptions,
    ) -> Result<Self> {
        if options.overfetch_factor == 0 {
            return Err(RagError::invalid("overfetch_factor must be >= 1"));
        }
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
            options,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Retrieve and pack context for `query_text`.
    ///
    /// A blank query or no matching candidates yields an empty result.
    pub async fn retrieve(
        &self,
        query_text: &str,
        k: usize,
        max_context_tokens: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<RetrievalResult> {
        if k == 0 {
            return Err(RagError::invalid("k must be >= 1"));
        }
        if query_text.trim().is_empty() {
            return Ok(RetrievalResult::empty());
        }

        let vector = self.embedder.embed_query(query_text, &self.model_id).await?;
        let hits = self
            .index
            .search(&SearchQuery {
                vector: &vector,
                model_id: &self.model_id,
                k: k.saturating_mul(self.options.overfetch_factor).max(k),
                filter,
            })
            .await?;

        let ranked: Vec<(usize, SearchHit)> = hits
            .into_iter()
            .filter(|h| self.options.min_score.map_or(true, |min| h.score > min))
            .enumerate()
            .map(|(i, h)| (i + 1, h))
            .collect();

        let candidates = ranked.len();
        let mut passages = merge_passages(ranked, self.options.adjacency_window);
        passages.truncate(k);
        let result = pack(passages, max_context_tokens);

        tracing::debug!(
            model = %self.model_id,
            k,
            candidates,
            packed = result.results.len(),
            citations = result.citations.len(),
            context_tokens = result.context_tokens,
            "retrieval complete"
        );
        Ok(result)
    }
}

/// Group ranked hits into passages, ordered by each passage's best rank.
fn merge_passages(ranked: Vec<(usize, SearchHit)>, window: usize) -> Vec<Passage> {
    let mut by_document: BTreeMap<String, Vec<(usize, SearchHit)>> = BTreeMap::new();
    for (rank, hit) in ranked {
        by_document
            .entry(hit.chunk.document_id.clone())
            .or_default()
            .push((rank, hit));
    }

    let mut passages: Vec<Passage> = Vec::new();
    for (_, mut hits) in by_document {
        hits.sort_by_key(|(_, h)| h.chunk.ordinal);
        let mut current: Option<Passage> = None;
        for (rank, hit) in hits {
            current = Some(match current.take() {
                Some(mut p) if window > 0 && p.accepts(&hit, window) => {
                    p.extend(rank, hit);
                    p
                }
                Some(p) => {
                    passages.push(p);
                    Passage::new(rank, hit)
                }
                None => Passage::new(rank, hit),
            });
        }
        passages.extend(current);
    }

    passages.sort_by_key(Passage::best_rank);
    passages
}

/// Greedily pack passages into the token budget.
fn pack(passages: Vec<Passage>, max_context_tokens: usize) -> RetrievalResult {
    let mut result = RetrievalResult::empty();

    for passage in passages {
        let label = result.citations.len() + 1;
        let prefix = format!("[{}] ", label);
        let cost = count_tokens(&prefix) + count_tokens(&passage.text);
        if result.context_tokens + cost > max_context_tokens {
            break;
        }

        if !result.context.is_empty() {
            result.context.push_str(PASSAGE_SEPARATOR);
        }
        result.context.push_str(&prefix);
        let context_start = result.context.len();
        result.context.push_str(&passage.text);
        result.context_tokens += cost;

        result.citations.push(Citation {
            label,
            document_id: passage.document_id.clone(),
            chunk_ids: passage
                .members
                .iter()
                .map(|(_, h)| h.chunk.chunk_id.clone())
                .collect(),
            title: passage.title.clone(),
            context_start,
            context_end: result.context.len(),
            start_offset: passage.start_offset,
            end_offset: passage.end_offset,
            byte_start: passage.byte_start,
            byte_end: passage.byte_end,
        });

        for (rank, hit) in passage.members {
            result.results.push(RetrievedChunk {
                rank,
                score: hit.score,
                document_id: hit.chunk.document_id,
                chunk_id: hit.chunk.chunk_id,
                ordinal: hit.chunk.ordinal,
                text: hit.chunk.text,
                start_offset: hit.chunk.start_offset,
                end_offset: hit.chunk.end_offset,
                token_count: hit.chunk.token_count,
            });
        }
    }

    result.results.sort_by_key(|r| r.rank);
    result
}
