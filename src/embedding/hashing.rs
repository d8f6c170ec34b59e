//! Feature-hashing embeddings.
//!
//! Each lowercased alphanumeric word is hashed with SHA-256; the first eight
//! bytes pick a dimension and the ninth picks a sign. The summed vector is
//! L2-normalized. Texts that share words score high under cosine, which is
//! enough for tests and offline trials without a model download.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use standards_search_core::embedding::{normalize, EmbeddingProvider};
use standards_search_core::ProviderError;

use crate::config::EmbeddingConfig;

const DEFAULT_DIMS: usize = 256;

pub struct HashingProvider {
    model: String,
    dims: usize,
    batch_size: usize,
    max_input_tokens: Option<usize>,
}

impl HashingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let dims = config.dims.unwrap_or(DEFAULT_DIMS);
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| format!("hashing-{}", dims));
        Self {
            model,
            dims,
            batch_size: config.batch_size,
            max_input_tokens: config.max_input_tokens,
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let digest = Sha256::digest(word.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    fn max_input_tokens(&self) -> Option<usize> {
        self.max_input_tokens
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use standards_search_core::embedding::cosine_similarity;

    fn provider() -> HashingProvider {
        HashingProvider::new(&EmbeddingConfig {
            provider: "hashing".to_string(),
            dims: Some(64),
            ..EmbeddingConfig::default()
        })
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let p = provider();
        let a = p.embed_one("Quality management systems");
        let b = p.embed_one("quality MANAGEMENT systems!");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_score_higher() {
        let p = provider();
        let query = p.embed_one("encryption key rotation");
        let related = p.embed_one("key rotation for encryption at rest");
        let unrelated = p.embed_one("fire door inspection intervals");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let p = provider();
        assert!(p.embed_one("  ").iter().all(|x| *x == 0.0));
    }
}
