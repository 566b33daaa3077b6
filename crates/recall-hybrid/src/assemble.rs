use std::collections::HashSet;

use recall_core::types::{ContextBundle, FusedResult, Passage, SizeBudget};

/// Greedily pack reranked chunks, in order, into a budget-bounded bundle.
///
/// Whole chunks only: assembly stops at the first chunk that would overflow the
/// budget. Repeated chunk ids are skipped. Size is measured in characters of
/// passage text.
pub fn assemble(reranked: &[FusedResult], budget: SizeBudget) -> ContextBundle {
    let max_chars = budget.max_chars();
    let mut seen = HashSet::new();
    let mut passages = Vec::new();
    let mut total_chars = 0usize;
    for r in reranked {
        if !seen.insert(r.chunk_id()) {
            continue;
        }
        let size = r.chunk.text.chars().count();
        if total_chars + size > max_chars {
            break;
        }
        total_chars += size;
        passages.push(Passage {
            chunk_id: r.chunk.chunk_id.clone(),
            citation: r.chunk.citation(),
            text: r.chunk.text.clone(),
            score: r.score,
        });
    }
    ContextBundle { passages, total_chars, budget, degraded: false, degradation: None }
}
