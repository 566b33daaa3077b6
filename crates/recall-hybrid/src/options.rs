//! Per-call parameter objects. Nothing here is global: two concurrent queries
//! can use different fusion methods or weights.

use chrono::{DateTime, Utc};
use serde::Serialize;

use recall_core::config::FusionMethod;
use recall_core::types::{ChunkId, Degradation, FusedResult, SizeBudget};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub vector: f32,
    pub lexical: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOptions {
    /// Results returned after reranking.
    pub k: usize,
    pub vector_limit: Option<usize>,
    pub lexical_limit: Option<usize>,
    /// Relevance floor for this query; falls back to the configured one.
    pub min_score: Option<f32>,
    pub min_results: Option<usize>,
    pub fusion: Option<FusionMethod>,
    pub weights: Option<Weights>,
    /// Boost recent chunks.
    pub recency: bool,
    /// Reference time for recency; defaults to now.
    pub now: Option<DateTime<Utc>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            k: 10,
            vector_limit: None,
            lexical_limit: None,
            min_score: None,
            min_results: None,
            fusion: None,
            weights: None,
            recency: false,
            now: None,
        }
    }
}

impl SearchOptions {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_fusion(mut self, method: FusionMethod) -> Self {
        self.fusion = Some(method);
        self
    }

    pub fn with_weights(mut self, vector: f32, lexical: f32) -> Self {
        self.weights = Some(Weights { vector, lexical });
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn recent(mut self) -> Self {
        self.recency = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetrieveOptions {
    pub search: SearchOptions,
    pub budget: SizeBudget,
}

impl RetrieveOptions {
    pub fn new(search: SearchOptions, budget: SizeBudget) -> Self {
        Self { search, budget }
    }
}

/// Ranked results of [`crate::HybridEngine::search`] with the degradation annotation.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<FusedResult>,
    pub degraded: bool,
    pub degradation: Option<Degradation>,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub source_id: String,
    /// Chunks the source has after ingestion.
    pub chunks: usize,
    /// New or changed chunks written to the indexes.
    pub indexed: usize,
    /// Chunks of the previous version that were dropped.
    pub removed: usize,
    pub embedded: usize,
    pub cached: usize,
    pub embedding_failed: Vec<ChunkId>,
    /// Identical text was already indexed; nothing was done.
    pub unchanged: bool,
}

impl IngestReport {
    pub fn unchanged(source_id: &str, chunks: usize) -> Self {
        Self {
            source_id: source_id.to_string(),
            chunks,
            indexed: 0,
            removed: 0,
            embedded: 0,
            cached: 0,
            embedding_failed: Vec::new(),
            unchanged: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub sources: usize,
    pub chunks: usize,
    pub terms: usize,
    pub postings: usize,
    pub avg_chunk_tokens: f32,
    pub vectors: usize,
    pub failed_embeddings: usize,
    pub cached_embeddings: usize,
    pub provider_tag: String,
    pub dim: usize,
}
