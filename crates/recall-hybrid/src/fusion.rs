//! Merge the lexical and vector candidate lists into one ranking.
//!
//! `fuse` is a pure function of its inputs: the method, weights and
//! normalization come in as a parameter object per call.

use std::cmp::Ordering;
use std::collections::HashMap;

use recall_core::config::{FusionConfig, FusionMethod, Normalization};
use recall_core::types::{FusedResult, RetrievalCandidate, ScoreRank};

/// Combine ranked candidate lists.
///
/// - `Rrf`: `sum 1 / (k + rank)` over the lists a chunk appears in.
/// - `Weighted`: `vector_weight * v + lexical_weight * l` over normalized scores.
/// - `Max`: the larger normalized score.
///
/// A chunk missing from one list scores 0 from that list and is never dropped.
/// Ties break by vector rank, then lexical rank, then chunk id.
pub fn fuse(
    lexical: &[RetrievalCandidate],
    vector: &[RetrievalCandidate],
    params: &FusionConfig,
) -> Vec<FusedResult> {
    let lex_norm = normalize(lexical, params.normalization);
    let vec_norm = normalize(vector, params.normalization);

    let mut merged: HashMap<&str, FusedResult> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for (list, is_vector) in [(lexical, false), (vector, true)] {
        for c in list {
            let entry = merged.entry(c.chunk.chunk_id.as_str()).or_insert_with(|| {
                order.push(c.chunk.chunk_id.as_str());
                FusedResult { chunk: c.chunk.clone(), score: 0.0, lexical: None, vector: None }
            });
            let slot = if is_vector { &mut entry.vector } else { &mut entry.lexical };
            // A list should not repeat a chunk; keep the best (first) rank if it does.
            if slot.is_none() {
                *slot = Some(ScoreRank { score: c.score, rank: c.rank });
            }
        }
    }

    let mut fused: Vec<FusedResult> =
        order.into_iter().filter_map(|id| merged.remove(id)).collect();
    for r in &mut fused {
        let id = r.chunk.chunk_id.as_str();
        let l = r.lexical.and(lex_norm.get(id).copied());
        let v = r.vector.and(vec_norm.get(id).copied());
        r.score = match params.method {
            FusionMethod::Rrf => {
                let contribution = |sr: Option<ScoreRank>| {
                    sr.map_or(0.0, |s| 1.0 / (params.rrf_k + s.rank as f32))
                };
                contribution(r.lexical) + contribution(r.vector)
            }
            FusionMethod::Weighted => {
                params.vector_weight * v.unwrap_or(0.0) + params.lexical_weight * l.unwrap_or(0.0)
            }
            FusionMethod::Max => match (v, l) {
                (Some(v), Some(l)) => v.max(l),
                (Some(x), None) | (None, Some(x)) => x,
                (None, None) => 0.0,
            },
        };
    }
    fused.sort_by(rank_order);
    fused
}

/// Score descending, then vector rank, lexical rank (absent ranks last), chunk id.
pub fn rank_order(a: &FusedResult, b: &FusedResult) -> Ordering {
    fn rank(sr: Option<ScoreRank>) -> usize {
        sr.map_or(usize::MAX, |s| s.rank)
    }
    b.score
        .total_cmp(&a.score)
        .then_with(|| rank(a.vector).cmp(&rank(b.vector)))
        .then_with(|| rank(a.lexical).cmp(&rank(b.lexical)))
        .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
}

/// Min-max into [0, 1] within the list. A list whose scores are all equal maps to 1.
fn normalize(list: &[RetrievalCandidate], how: Normalization) -> HashMap<&str, f32> {
    let min = list.iter().map(|c| c.score).fold(f32::INFINITY, f32::min);
    let max = list.iter().map(|c| c.score).fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    let mut out = HashMap::with_capacity(list.len());
    for c in list {
        let n = match how {
            Normalization::None => c.score,
            Normalization::MinMax if span > 0.0 => (c.score - min) / span,
            Normalization::MinMax => 1.0,
        };
        out.entry(c.chunk.chunk_id.as_str()).or_insert(n);
    }
    out
}
