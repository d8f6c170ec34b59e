//! Hand-off to an external generation model.
//!
//! The core does not validate generated text. It builds the prompt from a
//! [`RetrievalResult`], calls a [`GenerationProvider`], and reports which
//! citation labels the answer refers to.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{ProviderError, RagError, Result};
use crate::models::{RetrievalResult, SearchFilter};
use crate::retrieve::Retriever;

/// Text produced by a generation provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Generation {
    pub text: String,
    /// Citation labels referenced in `text`, ascending.
    pub used_citations: Vec<usize>,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
    ) -> std::result::Result<Generation, ProviderError>;
}

/// An answer together with the retrieval it was grounded on.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    /// `None` when retrieval found nothing and the generator was skipped.
    pub answer: Option<String>,
    pub used_citations: Vec<usize>,
    pub retrieval: RetrievalResult,
}

/// System prompt shared by chat-style providers.
pub const SYSTEM_PROMPT: &str = "You answer questions about technical standards. \
Use only the numbered passages provided. Cite passages with their bracketed \
number, e.g. [2]. If the passages do not contain the answer, say so.";

/// User message for a chat-style provider.
pub fn build_prompt(query: &str, retrieval: &RetrievalResult) -> String {
    format!(
        "Passages:\n\n{}\n\nQuestion: {}",
        retrieval.context,
        query.trim()
    )
}

/// Labels `[n]` in `text` that name one of the `citation_count` passages.
pub fn cited_labels(text: &str, citation_count: usize) -> Vec<usize> {
    let mut labels: Vec<usize> = text
        .split('[')
        .skip(1)
        .filter_map(|rest| rest.split_once(']'))
        .filter_map(|(inner, _)| inner.trim().parse::<usize>().ok())
        .filter(|n| *n >= 1 && *n <= citation_count)
        .collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Retrieve context for `query` and, when anything was found, ask
/// `generator` for an answer.
pub async fn answer(
    retriever: &Retriever,
    generator: &dyn GenerationProvider,
    query: &str,
    k: usize,
    max_context_tokens: usize,
    filter: Option<&SearchFilter>,
) -> Result<Answer> {
    let retrieval = retriever
        .retrieve(query, k, max_context_tokens, filter)
        .await?;
    if retrieval.is_empty() {
        return Ok(Answer {
            answer: None,
            used_citations: Vec::new(),
            retrieval,
        });
    }

    let generation = generator
        .generate(query, &retrieval)
        .await
        .map_err(|e| match e {
            ProviderError::InvalidInput(msg) => RagError::InvalidInput(msg),
            other => RagError::ProviderUnavailable {
                attempts: 1,
                message: other.to_string(),
            },
        })?;

    tracing::debug!(
        model = generator.model_name(),
        citations = generation.used_citations.len(),
        "generation complete"
    );

    Ok(Answer {
        answer: Some(generation.text),
        used_citations: generation.used_citations,
        retrieval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::chunk::ChunkParams;
    use crate::embedding::{Embedder, EmbedderOptions, EmbeddingProvider};
    use crate::index::memory::InMemoryIndex;
    use crate::index::VectorIndex;
    use crate::ingest::Ingestor;
    use crate::models::{Document, DocumentMetadata};
    use crate::retrieve::RetrievalOptions;

    struct Ones;

    #[async_trait]
    impl EmbeddingProvider for Ones {
        fn model_name(&self) -> &str {
            "ones"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![1.0, 1.0]).collect())
        }
    }

    struct Echo {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GenerationProvider for Echo {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(
            &self,
            _query: &str,
            retrieval: &RetrievalResult,
        ) -> std::result::Result<Generation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Unavailable("down".into()));
            }
            let text = format!("See [1] and [9]. {}", retrieval.citations.len());
            Ok(Generation {
                used_citations: cited_labels(&text, retrieval.citations.len()),
                text,
            })
        }
    }

    fn retriever() -> (Retriever, Ingestor) {
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::default());
        let embedder = Arc::new(
            Embedder::new(EmbedderOptions::default())
                .with_provider(Arc::new(Ones))
                .unwrap(),
        );
        (
            Retriever::new(embedder.clone(), index.clone(), "ones", RetrievalOptions::default())
                .unwrap(),
            Ingestor::new(embedder, index, "ones", ChunkParams::new(10, 2)).unwrap(),
        )
    }

    #[test]
    fn test_cited_labels() {
        assert_eq!(cited_labels("per [2], and [1] [2] [x] [7]", 3), vec![1, 2]);
        assert!(cited_labels("no citations", 3).is_empty());
        assert!(cited_labels("[0] [", 3).is_empty());
    }

    #[test]
    fn test_build_prompt_contains_context_and_question() {
        let retrieval = RetrievalResult {
            context: "[1] Scope.".into(),
            ..Default::default()
        };
        let prompt = build_prompt("  What is in scope? ", &retrieval);
        assert!(prompt.contains("[1] Scope."));
        assert!(prompt.ends_with("Question: What is in scope?"));
    }

    #[tokio::test]
    async fn test_answer_skips_generator_on_empty_retrieval() {
        let (retriever, _) = retriever();
        let echo = Echo {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let answer = answer(&retriever, &echo, "scope", 3, 100, None).await.unwrap();
        assert!(answer.answer.is_none());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_answer_uses_retrieval() {
        let (retriever, ingestor) = retriever();
        ingestor
            .ingest(&Document {
                document_id: "iso".into(),
                content_version: 1,
                text: "Scope of the standard.".into(),
                metadata: DocumentMetadata::default(),
            })
            .await
            .unwrap();

        let echo = Echo {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let answer = answer(&retriever, &echo, "scope", 3, 100, None).await.unwrap();
        assert_eq!(answer.answer.as_deref(), Some("See [1] and [9]. 1"));
        assert_eq!(answer.used_citations, vec![1]);
        assert_eq!(answer.retrieval.citations.len(), 1);

        let failing = Echo {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let err = super::answer(&retriever, &failing, "scope", 3, 100, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::ProviderUnavailable { .. }));
    }
}
