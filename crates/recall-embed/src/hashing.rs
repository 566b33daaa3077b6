use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

use recall_core::error::{Error, Result};
use recall_core::traits::EmbedProvider;

/// Deterministic feature-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed into one of `dim` buckets and the
/// result is L2-normalized, so texts sharing vocabulary land close together
/// under cosine similarity. No model files and no network: used for development,
/// tests and offline setups.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    id: String,
    dim: usize,
    max_len: usize,
}

impl HashEmbedder {
    pub const DEFAULT_MAX_LEN: usize = 8192;

    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::config("embedding dimension must be greater than zero"));
        }
        Ok(Self { id: format!("hash:d{dim}"), dim, max_len: Self::DEFAULT_MAX_LEN })
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        let end = text.char_indices().nth(self.max_len).map_or(text.len(), |(b, _)| b);
        let tokens = text[..end].split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty());
        for token in tokens {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            // High bit picks the sign so unrelated tokens cancel rather than pile up.
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign * (0.5 + ((h >> 32) as u32) as f32 / u32::MAX as f32);
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbedProvider for HashEmbedder {
    fn embedder_id(&self) -> &str {
        &self.id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Scale `v` to unit length; the zero vector is left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashEmbedder::new(256).expect("embedder");
        let q = e.embed_text("rainwater harvesting barrel");
        let near = e.embed_text("Harvesting rainwater into a barrel");
        let far = e.embed_text("sourdough starter feeding schedule");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn case_and_punctuation_do_not_matter() {
        let e = HashEmbedder::new(64).expect("embedder");
        assert_eq!(e.embed_text("Solar, Panel!"), e.embed_text("solar panel"));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new(8).expect("embedder");
        assert!(e.embed_text("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn zero_dim_is_rejected() {
        assert!(matches!(HashEmbedder::new(0), Err(Error::Configuration(_))));
    }
}
