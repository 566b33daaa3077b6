//! Issue lexical and vector candidate retrieval for one query.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use recall_core::error::Error;
use recall_core::types::{Chunk, ChunkId, Degradation, RetrievalCandidate, SourceKind};
use recall_vector::VectorIndexer;

use crate::state::IndexState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub vector: usize,
    pub lexical: usize,
}

/// Both candidate lists, each ranked independently (ranks are 1-based).
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub lexical: Vec<RetrievalCandidate>,
    pub vector: Vec<RetrievalCandidate>,
    pub degradation: Option<Degradation>,
}

impl Plan {
    pub fn degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

pub struct QueryPlanner<'a> {
    state: &'a RwLock<IndexState>,
    vector: &'a VectorIndexer,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(state: &'a RwLock<IndexState>, vector: &'a VectorIndexer) -> Self {
        Self { state, vector }
    }

    /// Run both paths concurrently. Never fails: a broken vector path degrades
    /// to lexical-only, a corrupted lexical index to vector-only.
    pub async fn plan(&self, query: &str, limits: PlanLimits) -> Plan {
        let (lexical, vector) = tokio::join!(
            self.lexical(query, limits.lexical),
            self.vector(query, limits.vector)
        );

        let mut plan = Plan::default();
        match vector {
            Ok(v) => plan.vector = v,
            Err(reason) => {
                warn!(%reason, "vector path degraded, continuing lexical-only");
                plan.degradation = Some(reason);
            }
        }
        match lexical {
            Ok(l) => plan.lexical = l,
            Err(reason) => {
                warn!(%reason, "lexical path degraded");
                plan.degradation.get_or_insert(reason);
            }
        }
        let (lexical, vector) = (plan.lexical.len(), plan.vector.len());
        debug!(lexical, vector, degraded = plan.degraded(), "planned query");
        plan
    }

    async fn lexical(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, Degradation> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        let hits = state
            .lexical
            .search(query, limit)
            .map_err(|e| Degradation::LexicalIndexCorrupted(e.to_string()))?;
        let mut chunks = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            // Postings and the chunk table are committed together, so a miss here is corruption.
            let chunk = state.chunk(&id).cloned().ok_or_else(|| {
                let source = state.lexical.doc(&id).map_or("unknown", |d| d.source_id.as_str());
                let detail = format!("posting for chunk {id} of {source} has no chunk row");
                Degradation::LexicalIndexCorrupted(detail)
            })?;
            chunks.push((chunk, score));
        }
        Ok(ranked(chunks, SourceKind::Lexical))
    }

    async fn vector(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, Degradation> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self
            .vector
            .embed_query(query)
            .await
            .map_err(|e| Degradation::VectorUnavailable(e.to_string()))?;
        // Held across the store lookup: ingestion writes vectors and chunk rows
        // under the write lock, so hits and rows come from the same commit.
        let state = self.state.read().await;
        let hits = self.vector.search(&embedding, limit).await.map_err(|e| match e {
            Error::IndexCorruption { .. } => Degradation::VectorIndexCorrupted(e.to_string()),
            other => Degradation::VectorUnavailable(other.to_string()),
        })?;
        Ok(ranked(visible(&state, hits), SourceKind::Vector))
    }
}

/// A replaced source's stale vectors are dropped just after its commit; skip
/// hits whose chunk is already gone.
fn visible(state: &IndexState, hits: Vec<(ChunkId, f32)>) -> Vec<(Arc<Chunk>, f32)> {
    hits.into_iter()
        .filter_map(|(id, score)| match state.chunk(&id) {
            Some(c) => Some((c.clone(), score)),
            None => {
                debug!(chunk_id = %id, "vector hit has no chunk row");
                None
            }
        })
        .collect()
}

fn ranked(hits: Vec<(Arc<Chunk>, f32)>, source: SourceKind) -> Vec<RetrievalCandidate> {
    hits.into_iter()
        .enumerate()
        .map(|(i, (chunk, score))| RetrievalCandidate { chunk, score, rank: i + 1, source })
        .collect()
}
