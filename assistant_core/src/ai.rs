//! AI provider contract plus the offline provider and embedding ranker used
//! when no remote model is configured.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::context::SimilarityRanker;
use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    pub system: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            system: None,
        }
    }
}

/// Uniform completion/embedding interface over whatever model backs it.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Deterministic bag-of-words embedder built on feature hashing. It has no
/// completion model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut idx = [0u8; 8];
            idx.copy_from_slice(&bytes[..8]);
            let slot = (u64::from_le_bytes(idx) % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl AiProvider for HashingEmbedder {
    fn name(&self) -> &str {
        "offline-hashing"
    }

    async fn complete(
        &self,
        _prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable(
            "offline provider has no completion model".into(),
        ))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Ranks candidates by cosine similarity of provider embeddings.
pub struct EmbeddingRanker {
    provider: Arc<dyn AiProvider>,
}

impl EmbeddingRanker {
    pub fn new(provider: Arc<dyn AiProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl SimilarityRanker for EmbeddingRanker {
    async fn rank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<(usize, f32)>, ProviderError> {
        let mut texts = Vec::with_capacity(candidates.len() + 1);
        texts.push(query.to_string());
        texts.extend_from_slice(candidates);

        let vectors = self.provider.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(ProviderError::Unavailable(format!(
                "provider returned {} embeddings for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        let (q, rest) = vectors.split_at(1);
        let scored: Vec<(usize, f32)> = rest
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine_similarity(&q[0], e)))
            .collect();
        debug!(provider = self.provider.name(), candidates = candidates.len(), "Ranked candidates");
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed_sync("Backup my home folder");
        let b = e.embed_sync("backup my HOME folder");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed_sync("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_ranker_prefers_overlapping_text() {
        let ranker = EmbeddingRanker::new(Arc::new(HashingEmbedder::default()));
        let candidates = vec![
            "what is the weather tomorrow".to_string(),
            "calculate 2 plus 2".to_string(),
        ];
        let scores = ranker.rank("calculate 3 plus 4", &candidates).await.unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[1].1 > scores[0].1);
    }

    #[tokio::test]
    async fn test_batch_embedding_keeps_input_order() {
        let p = HashingEmbedder::new(32);
        let texts = vec!["alpha".to_string(), String::new(), "beta".to_string()];
        let vectors = p.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], p.embed_sync("alpha"));
        assert!(vectors[1].iter().all(|x| *x == 0.0));
        assert_eq!(vectors[2], p.embed_sync("beta"));
    }

    struct ShortProvider;

    #[async_trait]
    impl AiProvider for ShortProvider {
        fn name(&self) -> &str {
            "short"
        }

        async fn complete(&self, _p: &str, _o: &CompletionOptions) -> Result<String, ProviderError> {
            Ok(String::new())
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(vec![vec![1.0]])
        }
    }

    #[tokio::test]
    async fn test_ranker_rejects_mismatched_batch() {
        let ranker = EmbeddingRanker::new(Arc::new(ShortProvider));
        let err = ranker
            .rank("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_offline_provider_cannot_complete() {
        let p = HashingEmbedder::default();
        let err = p.complete("hi", &CompletionOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
