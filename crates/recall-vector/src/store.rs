//! In-memory [`VectorStore`] with an optional JSON file behind it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

use recall_core::error::{Error, Result};
use recall_core::traits::VectorStore;
use recall_core::types::{ChunkId, SimilarityMetric, VectorRecord};

use crate::similarity::similarity;

pub const VECTORS_FILE: &str = "vectors.json";

/// Brute-force nearest-neighbour store keyed by chunk id.
///
/// Scans every record with a matching provider tag, which is fine for
/// personal-scale corpora (tens of thousands of chunks).
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    records: RwLock<HashMap<ChunkId, VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `dir/vectors.json` if present, otherwise start empty.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(VECTORS_FILE);
        if !path.exists() {
            return Ok(Self::new());
        }
        let records: Vec<VectorRecord> = serde_json::from_slice(&fs::read(&path)?)?;
        debug!(records = records.len(), path = %path.display(), "loaded vector records");
        let records = records.into_iter().map(|r| (r.chunk_id.clone(), r)).collect();
        Ok(Self { records: RwLock::new(records) })
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut map = self.records.write().await;
        for r in records {
            map.insert(r.chunk_id.clone(), r);
        }
        Ok(())
    }

    async fn remove(&self, ids: &[ChunkId]) -> Result<usize> {
        let mut map = self.records.write().await;
        Ok(ids.iter().filter(|id| map.remove(id.as_str()).is_some()).count())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn nearest(
        &self,
        query: &[f32],
        provider_tag: &str,
        metric: SimilarityMetric,
        limit: usize,
    ) -> Result<Vec<(ChunkId, f32)>> {
        let map = self.records.read().await;
        let mut scored = Vec::new();
        for r in map.values().filter(|r| r.provider_tag == provider_tag) {
            if r.embedding.len() != query.len() {
                return Err(Error::corruption(
                    "vector",
                    None,
                    format!(
                        "record {} has dimension {}, query has {}",
                        r.chunk_id,
                        r.embedding.len(),
                        query.len()
                    ),
                ));
            }
            scored.push((r.chunk_id.clone(), similarity(metric, query, &r.embedding)));
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn ids(&self) -> Result<Vec<ChunkId>> {
        let mut ids: Vec<ChunkId> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn persist(&self, dir: &Path) -> Result<()> {
        let mut records: Vec<VectorRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        fs::create_dir_all(dir)?;
        fs::write(dir.join(VECTORS_FILE), serde_json::to_vec(&records)?)?;
        Ok(())
    }
}
