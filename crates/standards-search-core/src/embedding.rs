//! Embedding provider trait, the batching [`Embedder`], and vector helpers.
//!
//! Concrete providers (OpenAI, Ollama, hashing, fastembed) live in the
//! `standards-search` app crate; they only have to implement
//! [`EmbeddingProvider::embed_batch`] for a single request.
//!
//! The [`Embedder`] owns everything around that call:
//!
//! - splitting input into batches of at most
//!   `min(batch_size, provider.max_batch_size())` texts
//! - running batches concurrently, bounded by a shared semaphore
//! - retrying rate limits and outages with exponential backoff
//! - validating vector count, length, and finiteness per model
//! - rejecting inputs longer than the provider's token limit
//!
//! # Retry Strategy
//!
//! - [`ProviderError::RateLimited`] → retry, honouring `retry_after`
//! - [`ProviderError::Unavailable`] → retry
//! - [`ProviderError::InvalidInput`] → fail immediately
//! - Backoff: `initial_backoff × 2^(attempt-1)`, capped at `max_backoff`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::Semaphore;

use crate::error::{ProviderError, RagError, Result};
use crate::tokenize::count_tokens;

/// Capability interface of an embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the declared vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Largest number of texts accepted in one request.
    fn max_batch_size(&self) -> usize {
        64
    }

    /// Largest input, in tokens of the shared tokenizer, if the provider
    /// has one.
    fn max_input_tokens(&self) -> Option<usize> {
        None
    }

    /// Embed one batch in a single provider call.
    async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;
}

/// Tuning for [`Embedder`].
#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for EmbedderOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_concurrency: 4,
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }
}

/// Batching, retrying, validating front end over registered providers.
///
/// One provider is registered per `model_id`; keeping several registered
/// lets two embedding generations coexist during a migration.
pub struct Embedder {
    providers: HashMap<String, Arc<dyn EmbeddingProvider>>,
    options: EmbedderOptions,
    permits: Semaphore,
}

impl Embedder {
    pub fn new(options: EmbedderOptions) -> Self {
        let permits = Semaphore::new(options.max_concurrency.max(1));
        Self {
            providers: HashMap::new(),
            options,
            permits,
        }
    }

    /// Builder-style [`register`](Embedder::register).
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        self.register(provider)?;
        Ok(self)
    }

    /// Register a provider under its model name.
    ///
    /// Re-registering a model with a different dimensionality is rejected.
    pub fn register(&mut self, provider: Arc<dyn EmbeddingProvider>) -> Result<()> {
        if provider.dims() == 0 {
            return Err(RagError::invalid(format!(
                "embedding model '{}' declares zero dimensions",
                provider.model_name()
            )));
        }
        if let Some(existing) = self.providers.get(provider.model_name()) {
            if existing.dims() != provider.dims() {
                return Err(RagError::invalid(format!(
                    "embedding model '{}' already registered with {} dims, got {}",
                    provider.model_name(),
                    existing.dims(),
                    provider.dims()
                )));
            }
        }
        self.providers
            .insert(provider.model_name().to_string(), provider);
        Ok(())
    }

    /// Registered dimensionality for `model_id`.
    pub fn dims(&self, model_id: &str) -> Option<usize> {
        self.providers.get(model_id).map(|p| p.dims())
    }

    /// Registered model ids, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.providers.keys().cloned().collect();
        models.sort();
        models
    }

    fn provider(&self, model_id: &str) -> Result<&Arc<dyn EmbeddingProvider>> {
        self.providers.get(model_id).ok_or_else(|| {
            RagError::invalid(format!("no embedding provider registered for model '{}'", model_id))
        })
    }

    /// Embed `texts` with `model_id`, one vector per text, in input order.
    ///
    /// Either every vector is returned or the call fails; a failing batch
    /// cancels the batches still in flight.
    pub async fn embed(&self, texts: &[String], model_id: &str) -> Result<Vec<Vec<f32>>> {
        let provider = self.provider(model_id)?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(limit) = provider.max_input_tokens() {
            for (i, text) in texts.iter().enumerate() {
                let tokens = count_tokens(text);
                if tokens > limit {
                    return Err(RagError::invalid(format!(
                        "input {} has {} tokens, model '{}' accepts at most {}",
                        i, tokens, model_id, limit
                    )));
                }
            }
        }

        let batch_size = self
            .options
            .batch_size
            .min(provider.max_batch_size())
            .max(1);

        let batches = texts
            .chunks(batch_size)
            .map(|batch| self.embed_batch_with_retry(provider.as_ref(), batch));
        let results = try_join_all(batches).await?;

        Ok(results.into_iter().flatten().collect())
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str, model_id: &str) -> Result<Vec<f32>> {
        let results = self.embed(&[text.to_string()], model_id).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| RagError::invalid("empty embedding response"))
    }

    async fn embed_batch_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        batch: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = self.permits.acquire().await.map_err(|e| {
                    RagError::ProviderUnavailable {
                        attempts: attempt,
                        message: e.to_string(),
                    }
                })?;
                provider.embed_batch(batch).await
            };

            let err = match outcome {
                Ok(vectors) => {
                    validate_vectors(provider, batch.len(), &vectors)?;
                    return Ok(vectors);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(RagError::InvalidInput(err.to_string()));
            }
            if attempt > self.options.max_retries {
                return Err(RagError::ProviderUnavailable {
                    attempts: attempt,
                    message: err.to_string(),
                });
            }

            let delay = self.backoff(attempt, &err);
            tracing::warn!(
                model = provider.model_name(),
                attempt,
                max_retries = self.options.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "embedding batch failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn backoff(&self, attempt: u32, err: &ProviderError) -> Duration {
        let exp = self
            .options
            .initial_backoff
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let delay = match err {
            ProviderError::RateLimited {
                retry_after: Some(after),
                ..
            } => (*after).max(exp),
            _ => exp,
        };
        delay.min(self.options.max_backoff)
    }
}

fn validate_vectors(
    provider: &dyn EmbeddingProvider,
    expected: usize,
    vectors: &[Vec<f32>],
) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::invalid(format!(
            "model '{}' returned {} vectors for {} inputs",
            provider.model_name(),
            vectors.len(),
            expected
        )));
    }
    for v in vectors {
        if v.len() != provider.dims() {
            return Err(RagError::invalid(format!(
                "model '{}' returned a {}-dim vector, registered dims are {}",
                provider.model_name(),
                v.len(),
                provider.dims()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(RagError::invalid(format!(
                "model '{}' returned a non-finite vector component",
                provider.model_name()
            )));
        }
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use standards_search_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Plain dot product; `0.0` for mismatched lengths.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns `[len, index, 1.0]` for each text.
    struct LengthProvider {
        max_batch: usize,
        batch_sizes: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for LengthProvider {
        fn model_name(&self) -> &str {
            "length"
        }
        fn dims(&self) -> usize {
            3
        }
        fn max_batch_size(&self) -> usize {
            self.max_batch
        }
        fn max_input_tokens(&self) -> Option<usize> {
            Some(4)
        }
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            self.batch_sizes.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.parse::<f32>().unwrap_or(0.0), 1.0])
                .collect())
        }
    }

    /// Fails with the given error `failures` times, then succeeds.
    struct FlakyProvider {
        failures: usize,
        error: ProviderError,
        calls: AtomicUsize,
        dims_returned: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            Ok(texts.iter().map(|_| vec![0.5; self.dims_returned]).collect())
        }
    }

    fn fast_options(max_retries: u32) -> EmbedderOptions {
        EmbedderOptions {
            batch_size: 64,
            max_concurrency: 2,
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn flaky(failures: usize, error: ProviderError) -> Arc<FlakyProvider> {
        Arc::new(FlakyProvider {
            failures,
            error,
            calls: AtomicUsize::new(0),
            dims_returned: 2,
        })
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let provider = Arc::new(LengthProvider {
            max_batch: 3,
            batch_sizes: Mutex::new(Vec::new()),
        });
        let embedder = Embedder::new(fast_options(0))
            .with_provider(provider.clone())
            .unwrap();

        let texts: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let vectors = embedder.embed(&texts, "length").await.unwrap();

        assert_eq!(vectors.len(), 8);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[1], i as f32);
        }
        let mut sizes = provider.batch_sizes.lock().unwrap().clone();
        sizes.sort();
        assert_eq!(sizes, vec![2, 3, 3]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let provider = Arc::new(LengthProvider {
            max_batch: 3,
            batch_sizes: Mutex::new(Vec::new()),
        });
        let embedder = Embedder::new(fast_options(0)).with_provider(provider).unwrap();
        assert!(embedder.embed(&[], "length").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_model_is_invalid_input() {
        let embedder = Embedder::new(fast_options(0));
        let err = embedder.embed(&["x".into()], "nope").await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_oversized_input_rejected_not_truncated() {
        let provider = Arc::new(LengthProvider {
            max_batch: 3,
            batch_sizes: Mutex::new(Vec::new()),
        });
        let embedder = Embedder::new(fast_options(0))
            .with_provider(provider.clone())
            .unwrap();
        let err = embedder
            .embed(&["one two three four five".into()], "length")
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        assert!(provider.batch_sizes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let provider = flaky(
            2,
            ProviderError::RateLimited {
                message: "429".into(),
                retry_after: Some(Duration::from_millis(5)),
            },
        );
        let embedder = Embedder::new(fast_options(3))
            .with_provider(provider.clone())
            .unwrap();
        let vectors = embedder.embed(&["a".into()], "flaky").await.unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.5]]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted_is_provider_unavailable() {
        let provider = flaky(10, ProviderError::Unavailable("503".into()));
        let embedder = Embedder::new(fast_options(2))
            .with_provider(provider.clone())
            .unwrap();
        let err = embedder.embed(&["a".into()], "flaky").await.unwrap_err();
        match err {
            RagError::ProviderUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalid_input_not_retried() {
        let provider = flaky(10, ProviderError::InvalidInput("bad".into()));
        let embedder = Embedder::new(fast_options(5))
            .with_provider(provider.clone())
            .unwrap();
        let err = embedder.embed(&["a".into()], "flaky").await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_invalid_input() {
        let provider = Arc::new(FlakyProvider {
            failures: 0,
            error: ProviderError::Unavailable(String::new()),
            calls: AtomicUsize::new(0),
            dims_returned: 3,
        });
        let embedder = Embedder::new(fast_options(0)).with_provider(provider).unwrap();
        let err = embedder.embed(&["a".into()], "flaky").await.unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let embedder = Embedder::new(fast_options(10));
        let unavailable = ProviderError::Unavailable(String::new());
        assert_eq!(embedder.backoff(1, &unavailable), Duration::from_millis(10));
        assert_eq!(embedder.backoff(2, &unavailable), Duration::from_millis(20));
        assert_eq!(embedder.backoff(9, &unavailable), Duration::from_millis(40));
        let limited = ProviderError::RateLimited {
            message: String::new(),
            retry_after: Some(Duration::from_millis(35)),
        };
        assert_eq!(embedder.backoff(1, &limited), Duration::from_millis(35));
    }

    #[test]
    fn test_register_rejects_dims_change() {
        struct Fixed(usize);
        #[async_trait]
        impl EmbeddingProvider for Fixed {
            fn model_name(&self) -> &str {
                "fixed"
            }
            fn dims(&self) -> usize {
                self.0
            }
            async fn embed_batch(
                &self,
                _texts: &[String],
            ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
                Ok(Vec::new())
            }
        }

        let mut embedder = Embedder::new(EmbedderOptions::default());
        embedder.register(Arc::new(Fixed(4))).unwrap();
        assert!(embedder.register(Arc::new(Fixed(4))).is_ok());
        assert!(embedder.register(Arc::new(Fixed(8))).is_err());
        assert!(embedder.register(Arc::new(Fixed(0))).is_err());
        assert_eq!(embedder.dims("fixed"), Some(4));
        assert_eq!(embedder.models(), vec!["fixed".to_string()]);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
