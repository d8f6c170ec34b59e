//! Overlapping token-window chunker.
//!
//! Splits document text into [`Chunk`]s of at most `target_tokens` tokens,
//! each starting `overlap_tokens` before the previous chunk's end.
//!
//! Each chunk receives a deterministic UUID (v5) derived from its document
//! ID, content version, and ordinal, plus a SHA-256 hash of its text.
//! Re-running the chunker on the same input yields the same ids and spans,
//! which is what makes re-ingestion idempotent.
//!
//! # Algorithm
//!
//! 1. Tokenize with [`tokenize`](crate::tokenize::tokenize).
//! 2. Open a window at `start`; its hard end is `min(start + T, N)`.
//! 3. If the window is not the last one and `boundary_tolerance > 0`, pull
//!    the end back to the latest sentence or paragraph break within the
//!    last `boundary_tolerance` tokens of the window.
//! 4. Emit the chunk, then restart at `end − O`.
//! 5. Stop once a chunk reaches token `N`.
//!
//! With `boundary_tolerance = 0` this produces
//! `ceil((N − O) / (T − O))` chunks for `N > T` and one chunk for `N ≤ T`.
//!
//! # Example
//!
//! ```rust
//! use standards_search_core::chunk::{chunk_text, ChunkParams};
//!
//! let chunks = chunk_text("iso-9001", 1, "Scope.\n\nNormative references.", &ChunkParams::new(500, 50)).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].ordinal, 0);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::Chunk;
use crate::tokenize::{is_breakpoint, tokenize, Token};

/// Namespace for chunk UUIDs.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6f2c_93a1_4d0e_5b7a_8c31_0f9e_d2b4_a617);

/// Window sizing for [`chunk_text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    /// Maximum tokens per chunk (`T`).
    pub target_tokens: usize,
    /// Tokens shared by consecutive chunks (`O`).
    pub overlap_tokens: usize,
    /// How far before the hard cut a natural breakpoint may be used.
    pub boundary_tolerance: usize,
}

impl ChunkParams {
    pub fn new(target_tokens: usize, overlap_tokens: usize) -> Self {
        Self {
            target_tokens,
            overlap_tokens,
            boundary_tolerance: 0,
        }
    }

    pub fn with_boundary_tolerance(mut self, tolerance: usize) -> Self {
        self.boundary_tolerance = tolerance;
        self
    }

    /// Reject parameter sets that could not make forward progress.
    pub fn validate(&self) -> Result<()> {
        if self.target_tokens == 0 {
            return Err(RagError::invalid("target_tokens must be > 0"));
        }
        if self.overlap_tokens >= self.target_tokens {
            return Err(RagError::invalid(format!(
                "overlap_tokens ({}) must be smaller than target_tokens ({})",
                self.overlap_tokens, self.target_tokens
            )));
        }
        if self.boundary_tolerance >= self.target_tokens - self.overlap_tokens {
            return Err(RagError::invalid(format!(
                "boundary_tolerance ({}) must be smaller than target_tokens - overlap_tokens ({})",
                self.boundary_tolerance,
                self.target_tokens - self.overlap_tokens
            )));
        }
        Ok(())
    }
}

/// Deterministic chunk id for `(document_id, content_version, ordinal)`.
pub fn chunk_id(document_id: &str, content_version: u64, ordinal: usize) -> String {
    let name = format!("{}:{}:{}", document_id, content_version, ordinal);
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}

/// Split `text` into overlapping chunks.
///
/// Empty or whitespace-only text yields no chunks. Fails with
/// [`RagError::InvalidInput`] when `params` would never advance the window.
pub fn chunk_text(
    document_id: &str,
    content_version: u64,
    text: &str,
    params: &ChunkParams,
) -> Result<Vec<Chunk>> {
    params.validate()?;

    let tokens = tokenize(text);
    let n = tokens.len();
    let mut chunks = Vec::new();
    if n == 0 {
        return Ok(chunks);
    }

    let mut start = 0;
    loop {
        let hard_end = (start + params.target_tokens).min(n);
        let end = if hard_end == n {
            n
        } else {
            soft_end(text, &tokens, hard_end, params.boundary_tolerance)
        };

        chunks.push(make_chunk(
            document_id,
            content_version,
            chunks.len(),
            text,
            &tokens,
            start,
            end,
        ));

        if end == n {
            break;
        }
        start = end - params.overlap_tokens;
    }

    Ok(chunks)
}

/// Latest end in `(hard_end - tolerance, hard_end]` that lands on a
/// breakpoint, or `hard_end` when none does.
fn soft_end(text: &str, tokens: &[Token], hard_end: usize, tolerance: usize) -> usize {
    (hard_end + 1 - tolerance.max(1)..=hard_end)
        .rev()
        .take(tolerance)
        .find(|&end| is_breakpoint(text, tokens, end - 1))
        .unwrap_or(hard_end)
}

fn make_chunk(
    document_id: &str,
    content_version: u64,
    ordinal: usize,
    text: &str,
    tokens: &[Token],
    start: usize,
    end: usize,
) -> Chunk {
    let byte_start = tokens[start].start;
    let byte_end = tokens[end - 1].end;
    let body = &text[byte_start..byte_end];

    Chunk {
        chunk_id: chunk_id(document_id, content_version, ordinal),
        document_id: document_id.to_string(),
        content_version,
        ordinal,
        text: body.to_string(),
        start_offset: start,
        end_offset: end,
        byte_start,
        byte_end,
        token_count: end - start,
        hash: hash_text(body),
    }
}

/// Hex SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
