//! Embedding provider seam.
//!
//! The engine never computes embeddings itself; it calls whatever implements
//! [`EmbeddingProvider`]. The provider reports a fixed dimension, and the
//! knowledge base checks every returned vector against it before anything
//! reaches the store.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::types::KbError;

/// Turns text into fixed-dimension vectors.
///
/// `embed` is batched: one input yields exactly one output vector, in order.
/// Provider failures (remote model down, quota, malformed response) surface
/// as [`KbError::Embedding`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError>;

    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;
}

/// Deterministic bag-of-words embedder for tests and offline runs.
///
/// Each token hashes into one of `dimension` buckets and the vector is
/// L2-normalized, so identical texts embed identically and texts sharing
/// words land measurably closer than unrelated ones. No semantics beyond
/// that, which is exactly what deterministic retrieval tests need.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(64)
    }
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, KbError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }

    #[tokio::test]
    async fn embeddings_are_deterministic_and_normalized() {
        let provider = MockEmbeddingProvider::new(32);
        let texts = vec!["the cat sat".to_string(), "the cat sat".to_string()];
        let vectors = provider.embed(&texts).await.unwrap();
        assert_eq!(vectors[0], vectors[1]);
        let norm: f32 = vectors[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_means_smaller_distance() {
        let provider = MockEmbeddingProvider::default();
        let texts = vec![
            "rust borrow checker ownership".to_string(),
            "rust ownership rules".to_string(),
            "gardening tips for tomatoes".to_string(),
        ];
        let vectors = provider.embed(&texts).await.unwrap();
        let near = l2(&vectors[0], &vectors[1]);
        let far = l2(&vectors[0], &vectors[2]);
        assert!(near < far, "overlap should pull vectors together: {near} vs {far}");
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let provider = MockEmbeddingProvider::new(8);
        let vectors = provider.embed(&["".to_string()]).await.unwrap();
        assert_eq!(vectors[0], vec![0.0; 8]);
    }
}
