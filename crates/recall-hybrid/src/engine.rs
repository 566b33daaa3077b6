//! `HybridEngine`: ingestion, hybrid search, context retrieval and persistence.
//!
//! Ingestion holds a per-source lock for chunking plus index writes. Embeddings
//! are computed outside any index lock; vectors, chunk rows and postings are
//! then written together under the state write lock, which is the moment a
//! chunk becomes visible. A failed vector write aborts before the state changes.
//! Queries only take read locks and never fail: problems on either path
//! degrade the result and are reported on it.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

use recall_core::chunker::Chunker;
use recall_core::config::{EngineConfig, FusionConfig};
use recall_core::error::{Error, Result};
use recall_core::traits::{EmbedProvider, VectorStore};
use recall_core::types::{content_hash, Chunk, ChunkId, ContextBundle, Degradation, Document};
use recall_text::LexicalIndex;
use recall_vector::{EmbedReport, StagedVectors, VectorIndexer};

use crate::assemble::assemble;
use crate::fusion::fuse;
use crate::options::{EngineStats, IngestReport, RetrieveOptions, SearchOptions, SearchOutcome};
use crate::planner::{Plan, PlanLimits, QueryPlanner};
use crate::rerank::{RerankOptions, Reranker};
use crate::state::{IndexState, SourceRecord, CHUNKS_FILE, LEXICAL_FILE, SOURCES_FILE};

type SourceLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Serializes writers of one source. Dropping it forgets the source's lock
/// once no other writer holds or waits on it.
struct SourceGuard<'a> {
    locks: &'a SourceLocks,
    source_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SourceGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.source_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.source_id);
        }
    }
}

pub struct HybridEngine {
    config: EngineConfig,
    chunker: Chunker,
    state: RwLock<IndexState>,
    vector: VectorIndexer,
    reranker: Reranker,
    source_locks: SourceLocks,
}

impl HybridEngine {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn EmbedProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            chunker: Chunker::new(config.chunking)?,
            state: RwLock::new(IndexState::new(LexicalIndex::new(config.lexical)?)),
            vector: VectorIndexer::new(provider, store, config.vector)?,
            reranker: Reranker::new(config.rerank).with_metric(config.vector.metric),
            source_locks: SourceLocks::default(),
            config,
        })
    }

    /// Reopen an engine saved with [`HybridEngine::save`]. An empty or missing
    /// directory yields an empty engine. Chunks without a vector record are
    /// marked `embedding_failed` so `retry_failed_embeddings` picks them up.
    pub async fn open(
        dir: &Path,
        config: EngineConfig,
        provider: Arc<dyn EmbedProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        let engine = Self::new(config, provider, store)?;
        if !dir.join(CHUNKS_FILE).exists() {
            debug!(dir = %dir.display(), "no saved index, starting empty");
            return Ok(engine);
        }

        let chunks: Vec<Chunk> = serde_json::from_slice(&fs::read(dir.join(CHUNKS_FILE))?)?;
        let sources: BTreeMap<String, SourceRecord> =
            serde_json::from_slice(&fs::read(dir.join(SOURCES_FILE))?)?;
        let lexical = LexicalIndex::load(&dir.join(LEXICAL_FILE))?;
        if lexical.params() != engine.config.lexical {
            warn!("saved BM25 parameters differ from configuration; keeping the saved ones");
        }

        let vector_ids: HashSet<ChunkId> = engine.vector.store().ids().await?.into_iter().collect();
        let missing: Vec<Chunk> =
            chunks.iter().filter(|c| !vector_ids.contains(&c.chunk_id)).cloned().collect();
        {
            let mut state = engine.state.write().await;
            state.lexical = lexical;
            state.sources = sources;
            state.chunks = chunks.into_iter().map(|c| (c.chunk_id.clone(), Arc::new(c))).collect();
        }
        if !missing.is_empty() {
            warn!(chunks = missing.len(), "chunks without vectors marked embedding_failed");
            engine.vector.mark_failed(missing, "no vector record when index was opened").await;
        }
        info!(dir = %dir.display(), "opened index");
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vector(&self) -> &VectorIndexer {
        &self.vector
    }

    async fn lock_source(&self, source_id: &str) -> SourceGuard<'_> {
        let lock = {
            let mut locks = self.source_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(source_id.to_string()).or_default().clone()
        };
        SourceGuard {
            locks: &self.source_locks,
            source_id: source_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    pub async fn ingest_document(&self, doc: &Document) -> Result<IngestReport> {
        self.ingest(&doc.source_id, &doc.text, doc.last_modified).await
    }

    /// Index (or re-index) one source. Identical text is a no-op; changed text
    /// replaces every chunk of the source.
    #[instrument(skip_all, fields(source_id = %source_id))]
    pub async fn ingest(
        &self,
        source_id: &str,
        text: &str,
        last_modified: DateTime<Utc>,
    ) -> Result<IngestReport> {
        let _guard = self.lock_source(source_id).await;
        let hash = content_hash(text);

        let doc = Document::new(source_id, text, last_modified);
        let chunks: Vec<Chunk> = self.chunker.chunk(&doc).collect();
        let (to_embed, stale) = {
            let state = self.state.read().await;
            if let Some(rec) = state.sources.get(source_id) {
                if rec.content_hash == hash {
                    debug!("source unchanged");
                    return Ok(IngestReport::unchanged(source_id, rec.chunk_ids.len()));
                }
            }
            let new_ids: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
            let to_embed: Vec<Chunk> = chunks
                .iter()
                .filter(|c| state.chunk(&c.chunk_id).map_or(true, |old| old.text != c.text))
                .cloned()
                .collect();
            let stale: Vec<ChunkId> = state
                .sources
                .get(source_id)
                .map(|r| {
                    let gone = |id: &&ChunkId| !new_ids.contains(id.as_str());
                    r.chunk_ids.iter().filter(gone).cloned().collect()
                })
                .unwrap_or_default();
            (to_embed, stale)
        };

        let staged = self.vector.prepare(&to_embed).await;

        let chunk_ids: Vec<ChunkId> = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let total = chunks.len();
        let embed = {
            let mut state = self.state.write().await;
            // Reused chunk ids get their new vectors here, so no reader pairs
            // a new embedding with the old text. Nothing below runs on error.
            let embed = self.vector.commit(staged).await?;
            state.remove_chunks(&stale);
            for c in chunks {
                state.lexical.add(&c);
                state.chunks.insert(c.chunk_id.clone(), Arc::new(c));
            }
            let record = SourceRecord {
                content_hash: hash,
                last_modified,
                chunk_ids,
                ingested_at: Utc::now(),
            };
            state.sources.insert(source_id.to_string(), record);
            embed
        };
        if !stale.is_empty() {
            self.vector.remove(&stale).await?;
        }

        info!(
            chunks = total,
            indexed = to_embed.len(),
            removed = stale.len(),
            failed = embed.failed.len(),
            "ingested source"
        );
        Ok(IngestReport {
            source_id: source_id.to_string(),
            chunks: total,
            indexed: to_embed.len(),
            removed: stale.len(),
            embedded: embed.embedded,
            cached: embed.cached,
            embedding_failed: embed.failed,
            unchanged: false,
        })
    }

    /// Ingest sources concurrently. Each source gets its own result; one
    /// failing never stops the others.
    pub async fn ingest_many(&self, docs: &[Document]) -> Vec<(String, Result<IngestReport>)> {
        let results = join_all(docs.iter().map(|d| async move {
            (d.source_id.clone(), self.ingest_document(d).await)
        }))
        .await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            for (source_id, r) in &results {
                if let Err(e) = r {
                    warn!(source_id = %source_id, error = %e, "ingestion failed");
                }
            }
        }
        info!(sources = results.len(), failed, "batch ingestion done");
        results
    }

    /// Drop a source from every index; returns how many chunks it had.
    pub async fn remove_source(&self, source_id: &str) -> Result<usize> {
        let _guard = self.lock_source(source_id).await;
        let ids = {
            let mut state = self.state.write().await;
            let rec = state
                .sources
                .remove(source_id)
                .ok_or_else(|| Error::NotFound(format!("source '{source_id}'")))?;
            state.remove_chunks(&rec.chunk_ids);
            rec.chunk_ids
        };
        self.vector.remove(&ids).await?;
        info!(source_id, chunks = ids.len(), "removed source");
        Ok(ids.len())
    }

    pub async fn plan(&self, query: &str, limits: PlanLimits) -> Plan {
        QueryPlanner::new(&self.state, &self.vector).plan(query, limits).await
    }

    fn fusion_params(&self, opts: &SearchOptions) -> FusionConfig {
        let mut params = self.config.fusion;
        if let Some(method) = opts.fusion {
            params.method = method;
        }
        if let Some(w) = opts.weights {
            params.vector_weight = w.vector;
            params.lexical_weight = w.lexical;
        }
        match params.validate() {
            Ok(()) => params,
            Err(e) => {
                warn!(error = %e, "ignoring per-query fusion overrides");
                self.config.fusion
            }
        }
    }

    /// Per-query floor, or `None` to use the configured one. Values outside
    /// the cosine range can never be met and are ignored.
    fn min_score(&self, opts: &SearchOptions) -> Option<f32> {
        let score = opts.min_score?;
        if (-1.0..=1.0).contains(&score) {
            Some(score)
        } else {
            warn!(min_score = score, "ignoring per-query min_score outside [-1, 1]");
            None
        }
    }

    /// Plan, fuse and rerank. Returns raw fused scores without assembly.
    #[instrument(skip_all, fields(k = opts.k))]
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> SearchOutcome {
        let limits = PlanLimits {
            vector: opts.vector_limit.unwrap_or(self.config.planner.vector_limit),
            lexical: opts.lexical_limit.unwrap_or(self.config.planner.lexical_limit),
        };
        let plan = self.plan(query, limits).await;
        let fused = fuse(&plan.lexical, &plan.vector, &self.fusion_params(opts));

        let rerank_opts = RerankOptions {
            min_score: self.min_score(opts),
            min_results: opts.min_results.unwrap_or(self.config.rerank.min_results),
            recency: opts.recency,
            now: opts.now.unwrap_or_else(Utc::now),
            degraded: plan.degraded(),
        };
        let mut results = self.reranker.rerank(query, fused, &rerank_opts);
        results.truncate(opts.k);

        let degradation = plan
            .degradation
            .clone()
            .or_else(|| results.is_empty().then_some(Degradation::NoCandidates));
        SearchOutcome {
            degraded: degradation.is_some(),
            degradation,
            lexical_candidates: plan.lexical.len(),
            vector_candidates: plan.vector.len(),
            results,
        }
    }

    /// Search and assemble a budget-bounded context bundle. Never fails; an
    /// empty bundle is flagged as degraded.
    #[instrument(skip_all, fields(budget = opts.budget.max_chars()))]
    pub async fn retrieve(&self, query: &str, opts: &RetrieveOptions) -> ContextBundle {
        let outcome = self.search(query, &opts.search).await;
        if outcome.results.is_empty() {
            return ContextBundle::empty(opts.budget, outcome.degradation);
        }
        let mut bundle = assemble(&outcome.results, opts.budget);
        bundle.degraded = outcome.degraded;
        bundle.degradation = outcome.degradation;
        bundle
    }

    /// Re-embed chunks marked `embedding_failed`. Chunks replaced or removed
    /// while the provider was busy are skipped.
    pub async fn retry_failed_embeddings(&self) -> Result<EmbedReport> {
        let mut staged: StagedVectors = self.vector.prepare_retry().await;
        if staged.is_empty() {
            return Ok(EmbedReport::default());
        }
        let state = self.state.write().await;
        staged.retain(|id, hash| state.chunk(id).is_some_and(|c| c.content_hash() == hash));
        let report = self.vector.commit(staged).await;
        drop(state);
        report
    }

    pub async fn chunk(&self, chunk_id: &str) -> Option<Arc<Chunk>> {
        self.state.read().await.chunk(chunk_id).cloned()
    }

    pub async fn sources(&self) -> BTreeMap<String, SourceRecord> {
        self.state.read().await.sources.clone()
    }

    /// Cross-check postings, chunk rows, source records and vector records.
    /// Meant to run while no ingestion is in flight: stale vectors of a
    /// replaced source are dropped just after its commit. The error names the
    /// source to re-index.
    pub async fn verify(&self) -> Result<()> {
        let result = self.verify_inner().await;
        if let Err(e) = &result {
            let source = e.affected_source();
            warn!(error = %e, ?source, "index corruption detected; re-index the affected source");
        }
        result
    }

    async fn verify_inner(&self) -> Result<()> {
        let state = self.state.read().await;
        state.lexical.verify()?;

        for (id, chunk) in &state.chunks {
            if !state.lexical.contains(id) {
                let detail = format!("chunk {id} has no postings entry");
                return Err(Error::corruption("lexical", Some(&chunk.source_id), detail));
            }
        }
        for id in state.lexical.chunk_ids() {
            if !state.chunks.contains_key(id) {
                let source = state.lexical.doc(id).map(|d| d.source_id.as_str());
                let detail = format!("postings entry {id} has no chunk row");
                return Err(Error::corruption("lexical", source, detail));
            }
        }
        for (source_id, rec) in &state.sources {
            for id in &rec.chunk_ids {
                match state.chunk(id) {
                    Some(c) if &c.source_id == source_id => {}
                    _ => {
                        return Err(Error::corruption(
                            "lexical",
                            Some(source_id),
                            format!("source lists chunk {id}, which is missing or foreign"),
                        ))
                    }
                }
            }
        }

        let tag = self.vector.provider_tag();
        let dim = self.vector.dim();
        let vector_ids: HashSet<ChunkId> = self.vector.store().ids().await?.into_iter().collect();
        for id in &vector_ids {
            if !state.chunks.contains_key(id) {
                let detail = format!("vector record {id} has no chunk row");
                return Err(Error::corruption("vector", None, detail));
            }
        }
        for (id, chunk) in &state.chunks {
            if !vector_ids.contains(id) {
                if self.vector.is_failed(id).await {
                    continue;
                }
                return Err(Error::corruption(
                    "vector",
                    Some(&chunk.source_id),
                    format!("chunk {id} has no vector and is not marked embedding_failed"),
                ));
            }
            if let Some(rec) = self.vector.store().get(id).await? {
                if rec.provider_tag != tag || rec.embedding.len() != dim {
                    return Err(Error::corruption(
                        "vector",
                        Some(&chunk.source_id),
                        format!(
                            "chunk {id} vector is {}/{} but index is {tag}/{dim}",
                            rec.provider_tag,
                            rec.embedding.len()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let vs = self.vector.stats().await?;
        let state = self.state.read().await;
        Ok(EngineStats {
            sources: state.sources.len(),
            chunks: state.chunks.len(),
            terms: state.lexical.term_count(),
            postings: state.lexical.posting_count(),
            avg_chunk_tokens: state.lexical.avg_len(),
            vectors: vs.records,
            failed_embeddings: vs.failed,
            cached_embeddings: vs.cached,
            provider_tag: vs.provider_tag,
            dim: vs.dim,
        })
    }

    /// Write `chunks.json`, `sources.json`, `lexical.json` and let the vector
    /// store persist itself into `dir`.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        {
            let state = self.state.read().await;
            let mut chunks: Vec<&Chunk> = state.chunks.values().map(Arc::as_ref).collect();
            chunks.sort_by(|a, b| {
                a.source_id.cmp(&b.source_id).then(a.start_offset.cmp(&b.start_offset))
            });
            fs::write(dir.join(CHUNKS_FILE), serde_json::to_vec(&chunks)?)?;
            fs::write(dir.join(SOURCES_FILE), serde_json::to_vec(&state.sources)?)?;
            state.lexical.save(&dir.join(LEXICAL_FILE))?;
        }
        self.vector.store().persist(dir).await?;
        info!(dir = %dir.display(), "saved index");
        Ok(())
    }
}

impl std::fmt::Debug for HybridEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridEngine")
            .field("config", &self.config)
            .field("vector", &self.vector)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recall_vector::InMemoryVectorStore;

    struct Unit;

    #[async_trait]
    impl EmbedProvider for Unit {
        fn embedder_id(&self) -> &str {
            "unit:d2"
        }
        fn dim(&self) -> usize {
            2
        }
        fn max_len(&self) -> usize {
            1_000
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn engine() -> HybridEngine {
        let store = Arc::new(InMemoryVectorStore::new());
        HybridEngine::new(EngineConfig::default(), Arc::new(Unit), store).expect("engine")
    }

    fn tracked_sources(engine: &HybridEngine) -> usize {
        engine.source_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[tokio::test]
    async fn source_locks_are_released_after_writes() {
        let engine = engine();
        let docs: Vec<Document> = (0..20)
            .map(|i| Document::new(format!("note-{i}.md"), "plant garlic in autumn", Utc::now()))
            .collect();
        for (_, r) in engine.ingest_many(&docs).await {
            r.expect("ingest");
        }
        assert_eq!(tracked_sources(&engine), 0);

        engine.remove_source("note-3.md").await.expect("remove");
        assert!(engine.remove_source("note-3.md").await.is_err());
        assert_eq!(tracked_sources(&engine), 0);
    }

    #[tokio::test]
    async fn waiting_writer_keeps_the_lock_alive() {
        let engine = engine();
        let first = engine.lock_source("a.md").await;
        let second = engine.lock_source("a.md");
        tokio::pin!(second);
        // Registers the waiter without acquiring.
        assert!(futures::poll!(second.as_mut()).is_pending());
        drop(first);
        assert_eq!(tracked_sources(&engine), 1);
        let second = second.await;
        drop(second);
        assert_eq!(tracked_sources(&engine), 0);
    }
}
