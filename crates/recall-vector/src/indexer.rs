//! Batched embedding into a [`VectorStore`] with a write-through cache.
//!
//! Indexing runs in two steps. [`VectorIndexer::prepare`] consults the cache,
//! embeds misses under a timeout and retries transient failures with
//! exponential backoff; nothing touches the store yet. [`VectorIndexer::commit`]
//! then writes every staged record in one upsert, so a storage failure leaves
//! the store as it was. Chunks whose batch still fails are marked
//! `embedding_failed`: they get no vector (any stale one is dropped) and stay
//! out of vector search until [`VectorIndexer::retry_failed`] succeeds for
//! them. The lexical path is untouched, so they remain retrievable.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use recall_core::config::VectorConfig;
use recall_core::error::{Error, Result};
use recall_core::traits::{EmbedProvider, VectorStore};
use recall_core::types::{Chunk, ChunkId, VectorRecord};

use crate::cache::{CacheEntry, EmbeddingCache};

#[derive(Debug, Clone)]
pub struct FailedEmbedding {
    pub chunk: Chunk,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    /// Chunks embedded by a provider call.
    pub embedded: usize,
    /// Chunks served from the cache.
    pub cached: usize,
    /// Chunks marked `embedding_failed`.
    pub failed: Vec<ChunkId>,
    /// Extra provider calls made after transient failures.
    pub retries: u32,
}

impl EmbedReport {
    pub fn indexed(&self) -> usize {
        self.embedded + self.cached
    }

    fn merge(&mut self, other: EmbedReport) {
        self.embedded += other.embedded;
        self.cached += other.cached;
        self.failed.extend(other.failed);
        self.retries += other.retries;
    }
}

/// Embeddings computed by [`VectorIndexer::prepare`] and not yet written.
#[derive(Debug, Default)]
pub struct StagedVectors {
    /// Content hash of the embedded text next to each record.
    records: Vec<(String, VectorRecord)>,
    failed: Vec<FailedEmbedding>,
    report: EmbedReport,
}

impl StagedVectors {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.failed.is_empty()
    }

    pub fn report(&self) -> &EmbedReport {
        &self.report
    }

    /// Drop staged chunks for which `keep(chunk_id, content_hash)` is false.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        let before = self.records.len();
        self.records.retain(|(hash, r)| keep(&r.chunk_id, hash));
        let dropped = before - self.records.len();
        self.report.embedded = self.report.embedded.saturating_sub(dropped);
        self.failed.retain(|f| keep(&f.chunk.chunk_id, &f.chunk.content_hash()));
        self.report.failed = self.failed.iter().map(|f| f.chunk.chunk_id.clone()).collect();
    }

    fn merge(&mut self, other: StagedVectors) {
        self.records.extend(other.records);
        self.failed.extend(other.failed);
        self.report.merge(other.report);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorStats {
    pub records: usize,
    pub failed: usize,
    pub cached: usize,
    pub provider_tag: String,
    pub dim: usize,
}

pub struct VectorIndexer {
    provider: Arc<dyn EmbedProvider>,
    store: Arc<dyn VectorStore>,
    config: VectorConfig,
    cache: EmbeddingCache,
    failed: RwLock<HashMap<ChunkId, FailedEmbedding>>,
}

impl VectorIndexer {
    pub fn new(
        provider: Arc<dyn EmbedProvider>,
        store: Arc<dyn VectorStore>,
        config: VectorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: EmbeddingCache::new(config.cache_capacity),
            provider,
            store,
            config,
            failed: RwLock::new(HashMap::new()),
        })
    }

    pub fn provider_tag(&self) -> &str {
        self.provider.embedder_id()
    }

    pub fn dim(&self) -> usize {
        self.provider.dim()
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn config(&self) -> VectorConfig {
        self.config
    }

    pub async fn add(&self, chunk: &Chunk) -> Result<EmbedReport> {
        self.add_batch(std::slice::from_ref(chunk)).await
    }

    /// Embed and store `chunks`: [`prepare`](Self::prepare) then
    /// [`commit`](Self::commit).
    ///
    /// Provider failures never surface as `Err`; they end up in
    /// [`EmbedReport::failed`]. Storage failures do, and then nothing was
    /// written.
    pub async fn add_batch(&self, chunks: &[Chunk]) -> Result<EmbedReport> {
        let staged = self.prepare(chunks).await;
        self.commit(staged).await
    }

    /// Embed `chunks` in provider calls of at most `batch_size` texts without
    /// writing to the store.
    #[instrument(skip_all, fields(chunks = chunks.len(), provider = %self.provider.embedder_id()))]
    pub async fn prepare(&self, chunks: &[Chunk]) -> StagedVectors {
        let mut staged = StagedVectors::default();
        for batch in chunks.chunks(self.config.batch_size) {
            staged.merge(self.embed(batch).await);
        }
        debug!(
            embedded = staged.report.embedded,
            cached = staged.report.cached,
            retries = staged.report.retries,
            "embedding done"
        );
        staged
    }

    /// Write staged records in a single upsert, drop stale vectors of chunks
    /// that failed to embed and update the `embedding_failed` marks.
    pub async fn commit(&self, staged: StagedVectors) -> Result<EmbedReport> {
        let StagedVectors { records, failed, report } = staged;
        let ids: Vec<ChunkId> = records.iter().map(|(_, r)| r.chunk_id.clone()).collect();
        if !records.is_empty() {
            self.store.upsert(records.into_iter().map(|(_, r)| r).collect()).await?;
        }
        if !failed.is_empty() {
            warn!(failed = failed.len(), "chunks marked embedding_failed");
            let failed_ids: Vec<ChunkId> =
                failed.iter().map(|f| f.chunk.chunk_id.clone()).collect();
            // A re-ingested chunk may still carry a vector for its old text.
            self.store.remove(&failed_ids).await?;
        }
        let mut marks = self.failed.write().await;
        for id in &ids {
            marks.remove(id);
        }
        for f in failed {
            marks.insert(f.chunk.chunk_id.clone(), f);
        }
        Ok(report)
    }

    async fn embed(&self, batch: &[Chunk]) -> StagedVectors {
        let tag = self.provider.embedder_id().to_string();
        let hashes: Vec<String> = batch.iter().map(Chunk::content_hash).collect();
        let hits = self.cache.get_many(&tag, &hashes).await;

        let mut vectors: Vec<Option<Vec<f32>>> =
            hashes.iter().map(|h| hits.get(h).cloned()).collect();
        let miss_indices: Vec<usize> = (0..batch.len()).filter(|&i| vectors[i].is_none()).collect();
        let mut staged = StagedVectors::default();
        staged.report.cached = batch.len() - miss_indices.len();

        if !miss_indices.is_empty() {
            let texts: Vec<String> =
                miss_indices.iter().map(|&i| self.clip(&batch[i].text)).collect();
            match self.embed_with_retry(&texts).await {
                Ok((embs, retries)) => {
                    staged.report.retries += retries;
                    let mut entries = Vec::with_capacity(embs.len());
                    for (&i, v) in miss_indices.iter().zip(embs) {
                        entries.push(CacheEntry {
                            content_hash: hashes[i].clone(),
                            embedder_id: tag.clone(),
                            vector: v.clone(),
                        });
                        vectors[i] = Some(v);
                    }
                    staged.report.embedded = miss_indices.len();
                    self.cache.put_many(entries).await;
                }
                Err((err, attempts)) => {
                    staged.report.retries += attempts.saturating_sub(1);
                    let chunks = miss_indices.len();
                    warn!(error = %err, attempts, chunks, "embedding batch failed after retries");
                    for &i in &miss_indices {
                        staged.report.failed.push(batch[i].chunk_id.clone());
                        staged.failed.push(FailedEmbedding {
                            chunk: batch[i].clone(),
                            error: err.to_string(),
                            attempts,
                            failed_at: Utc::now(),
                        });
                    }
                }
            }
        }

        for ((c, hash), v) in batch.iter().zip(hashes).zip(vectors) {
            if let Some(embedding) = v {
                let record = VectorRecord {
                    chunk_id: c.chunk_id.clone(),
                    embedding,
                    provider_tag: tag.clone(),
                };
                staged.records.push((hash, record));
            }
        }
        staged
    }

    fn clip(&self, text: &str) -> String {
        text.chars().take(self.provider.max_len()).collect()
    }

    /// One provider call bounded by `timeout_ms`, with the response shape checked.
    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let provider = self.provider.embedder_id();
        let after = Duration::from_millis(self.config.timeout_ms);
        let embs = tokio::time::timeout(after, self.provider.embed_batch(texts))
            .await
            .map_err(|_| Error::Timeout {
                provider: provider.to_string(),
                after_ms: self.config.timeout_ms,
            })??;
        if embs.len() != texts.len() {
            return Err(Error::provider(
                provider,
                format!("returned {} vectors for {} texts", embs.len(), texts.len()),
            ));
        }
        let dim = self.provider.dim();
        if let Some(bad) = embs.iter().find(|v| v.len() != dim) {
            let detail = format!("dim mismatch: got {} expected {dim}", bad.len());
            return Err(Error::provider(provider, detail));
        }
        Ok(embs)
    }

    /// Returns the vectors and the number of retries, or the last error and the
    /// number of attempts made.
    async fn embed_with_retry(
        &self,
        texts: &[String],
    ) -> std::result::Result<(Vec<Vec<f32>>, u32), (Error, u32)> {
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.embed_once(texts).await {
                Ok(embs) => return Ok((embs, attempt - 1)),
                Err(e) if e.is_transient() && attempt <= self.config.max_retries => {
                    let backoff_ms = backoff.as_millis() as u64;
                    warn!(error = %e, attempt, backoff_ms, "embedding call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Re-attempt every chunk marked `embedding_failed`.
    pub async fn retry_failed(&self) -> Result<EmbedReport> {
        let staged = self.prepare_retry().await;
        self.commit(staged).await
    }

    /// Embed every chunk marked `embedding_failed` without writing, so a caller
    /// can drop chunks that changed meanwhile before [`commit`](Self::commit).
    pub async fn prepare_retry(&self) -> StagedVectors {
        let pending: Vec<Chunk> = self.failed().await.into_iter().map(|f| f.chunk).collect();
        if pending.is_empty() {
            return StagedVectors::default();
        }
        info!(chunks = pending.len(), "retrying failed embeddings");
        self.prepare(&pending).await
    }

    /// Drop vectors and failure marks for `ids`.
    pub async fn remove(&self, ids: &[ChunkId]) -> Result<usize> {
        {
            let mut failed = self.failed.write().await;
            for id in ids {
                failed.remove(id);
            }
        }
        self.store.remove(ids).await
    }

    /// Embed a query text: a single attempt bounded by the configured timeout.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut embs = self.embed_once(&[self.clip(text)]).await?;
        embs.pop()
            .ok_or_else(|| Error::provider(self.provider.embedder_id(), "empty response for query"))
    }

    /// Nearest chunks to `query_embedding`, best first, excluding failed chunks.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<(ChunkId, f32)>> {
        if query_embedding.len() != self.provider.dim() {
            return Err(Error::corruption(
                "vector",
                None,
                format!(
                    "query has dimension {}, index expects {}",
                    query_embedding.len(),
                    self.provider.dim()
                ),
            ));
        }
        let failed = self.failed.read().await;
        let mut hits = self
            .store
            .nearest(
                query_embedding,
                self.provider.embedder_id(),
                self.config.metric,
                limit + failed.len(),
            )
            .await?;
        hits.retain(|(id, _)| !failed.contains_key(id));
        hits.truncate(limit);
        Ok(hits)
    }

    pub async fn is_failed(&self, chunk_id: &str) -> bool {
        self.failed.read().await.contains_key(chunk_id)
    }

    pub async fn failed(&self) -> Vec<FailedEmbedding> {
        let mut out: Vec<FailedEmbedding> = self.failed.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.chunk.chunk_id.cmp(&b.chunk.chunk_id));
        out
    }

    /// Restore failure marks, e.g. after reopening a saved engine.
    pub async fn mark_failed(&self, chunks: Vec<Chunk>, error: &str) {
        let mut failed = self.failed.write().await;
        for chunk in chunks {
            let id = chunk.chunk_id.clone();
            let mark = FailedEmbedding {
                chunk,
                error: error.to_string(),
                attempts: 0,
                failed_at: Utc::now(),
            };
            failed.insert(id, mark);
        }
    }

    pub async fn failed_count(&self) -> usize {
        self.failed.read().await.len()
    }

    pub async fn stats(&self) -> Result<VectorStats> {
        Ok(VectorStats {
            records: self.store.len().await?,
            failed: self.failed_count().await,
            cached: self.cache.len().await,
            provider_tag: self.provider.embedder_id().to_string(),
            dim: self.provider.dim(),
        })
    }
}

impl std::fmt::Debug for VectorIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndexer")
            .field("provider", &self.provider.embedder_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
