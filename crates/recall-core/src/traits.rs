use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::types::{ChunkId, SimilarityMetric, VectorRecord};

/// Black-box text to vector function. Implementations must return vectors of
/// `dim()` entries for a given `embedder_id()`; calls may fail or hang, and the
/// vector indexer bounds them with a timeout.
#[async_trait]
pub trait EmbedProvider: Send + Sync {
    /// Stable identifier for the provider/model (e.g., `hash:d384`).
    fn embedder_id(&self) -> &str;
    /// Embedding dimensionality (D).
    fn dim(&self) -> usize;
    /// Maximum input length the provider accepts, in characters.
    fn max_len(&self) -> usize;
    /// Compute embeddings for a batch of input texts, one vector per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Durable home for vector records, keyed by chunk id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite records by `chunk_id`.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;
    /// Delete records; returns how many existed.
    async fn remove(&self, ids: &[ChunkId]) -> Result<usize>;
    async fn get(&self, id: &str) -> Result<Option<VectorRecord>>;
    /// Top `limit` records with the given provider tag, best first.
    async fn nearest(
        &self,
        query: &[f32],
        provider_tag: &str,
        metric: SimilarityMetric,
        limit: usize,
    ) -> Result<Vec<(ChunkId, f32)>>;
    async fn ids(&self) -> Result<Vec<ChunkId>>;
    async fn len(&self) -> Result<usize>;
    /// Flush to `dir` for stores that are not already durable.
    async fn persist(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}
