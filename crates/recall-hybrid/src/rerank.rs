//! Four ordered refinements over the fused list:
//! relevance floor, near-duplicate suppression, recency, query-shape boost.
//!
//! Recency and shape run last because they are cheap nudges that must not undo
//! what the floor and diversity stages decided.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use recall_core::config::{RecencyDecay, RerankConfig, MIN_RELAX_STEP};
use recall_core::types::{FusedResult, SimilarityMetric};
use recall_text::Analyzer;

use crate::fusion::rank_order;

/// Per-query knobs for [`Reranker::rerank`].
#[derive(Debug, Clone, Copy)]
pub struct RerankOptions {
    /// Overrides the configured relevance floor for this query.
    pub min_score: Option<f32>,
    /// Fewest results the relevance floor may leave.
    pub min_results: usize,
    /// Apply the recency stage.
    pub recency: bool,
    /// Reference time for chunk age.
    pub now: DateTime<Utc>,
    /// Vector path was unavailable; similarities are missing or untrusted.
    pub degraded: bool,
}

impl RerankOptions {
    pub fn new(config: &RerankConfig) -> Self {
        Self {
            min_score: None,
            min_results: config.min_results,
            recency: false,
            now: Utc::now(),
            degraded: false,
        }
    }
}

/// Shape detected from the query text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryShape {
    /// Normalized query when it has at least two words.
    pub phrase: Option<String>,
    pub code_like: bool,
    /// Header text for header-like queries.
    pub header: Option<String>,
}

const CODE_MARKERS: &[&str] = &["(", ")", "{", "}", ";", "::", "->", "=>", "`"];
const MAX_HEADER_WORDS: usize = 8;

impl QueryShape {
    pub fn detect(query: &str) -> Self {
        let trimmed = query.trim();
        let words: Vec<&str> = trimmed.split_whitespace().collect();
        let phrase = (words.len() >= 2).then(|| normalize_ws(trimmed));
        let code_like = CODE_MARKERS.iter().any(|m| trimmed.contains(m));

        let header = if let Some(rest) = trimmed.strip_prefix('#') {
            Some(rest.trim_start_matches('#').trim().to_lowercase())
        } else if !code_like
            && !words.is_empty()
            && words.len() <= MAX_HEADER_WORDS
            && is_title_case(&words)
        {
            Some(trimmed.to_lowercase())
        } else {
            None
        };
        Self { phrase, code_like, header: header.filter(|h| !h.is_empty()) }
    }
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn is_title_case(words: &[&str]) -> bool {
    let first = |w: &&str| w.chars().next();
    words.iter().all(|w| first(w).is_some_and(|c| c.is_uppercase() || !c.is_alphabetic()))
        && words.iter().any(|w| first(w).is_some_and(char::is_uppercase))
}

#[derive(Debug, Clone)]
pub struct Reranker {
    config: RerankConfig,
    metric: SimilarityMetric,
    analyzer: Analyzer,
}

impl Reranker {
    pub fn new(config: RerankConfig) -> Self {
        Self { config, metric: SimilarityMetric::Cosine, analyzer: Analyzer::plain() }
    }

    /// The floor is a cosine similarity; other metrics skip that stage.
    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    pub fn rerank(
        &self,
        query: &str,
        fused: Vec<FusedResult>,
        opts: &RerankOptions,
    ) -> Vec<FusedResult> {
        let before = fused.len();
        let mut out = self.relevance_floor(fused, opts);
        let after_floor = out.len();
        out = self.diversify(out);
        let after_diversity = out.len();
        if opts.recency {
            self.apply_recency(&mut out, opts.now);
        }
        if self.config.shape_boost {
            self.apply_shape(&mut out, &QueryShape::detect(query));
        }
        if opts.recency || self.config.shape_boost {
            out.sort_by(rank_order);
        }
        debug!(before, after_floor, after_diversity, "reranked");
        out
    }

    /// Drop results whose vector similarity is below the floor. The floor is
    /// relaxed by `relax_step` until `min_results` survive, and never below -1.
    /// Lexical-only results carry no similarity and always pass. Only cosine
    /// similarities are bounded, so the stage is skipped for other metrics.
    pub fn relevance_floor(
        &self,
        fused: Vec<FusedResult>,
        opts: &RerankOptions,
    ) -> Vec<FusedResult> {
        let Some(start) = opts.min_score.or(self.config.relevance_floor) else {
            return fused;
        };
        if opts.degraded {
            return fused;
        }
        if self.metric != SimilarityMetric::Cosine {
            debug!(metric = ?self.metric, "relevance floor only applies to cosine similarity");
            return fused;
        }
        if !start.is_finite() {
            debug!(floor = start, "ignoring non-finite relevance floor");
            return fused;
        }
        let step = self.config.relax_step.max(MIN_RELAX_STEP);
        let passes =
            |r: &FusedResult, floor: f32| r.vector_similarity().map_or(true, |s| s >= floor);

        let wanted = opts.min_results.min(fused.len());
        let top = start.clamp(-1.0, 1.0);
        let mut floor = top;
        let max_steps = ((top + 1.0) / step).ceil() as u32;
        let mut steps = 0;
        loop {
            let kept = fused.iter().filter(|r| passes(r, floor)).count();
            if kept >= wanted {
                break;
            }
            if steps >= max_steps || floor <= -1.0 {
                return fused;
            }
            steps += 1;
            floor = (top - step * steps as f32).max(-1.0);
            debug!(floor, kept, wanted, "relaxing relevance floor");
        }
        fused.into_iter().filter(|r| passes(r, floor)).collect()
    }

    /// Drop a result whose shingle Jaccard with any kept, higher-ranked result
    /// exceeds the threshold.
    ///
    /// Pairwise and quadratic: this runs on the post-fusion candidate set (tens
    /// of items). It is not meant for corpus-wide deduplication.
    pub fn diversify(&self, ranked: Vec<FusedResult>) -> Vec<FusedResult> {
        let Some(threshold) = self.config.diversity_threshold else {
            return ranked;
        };
        let mut kept: Vec<(FusedResult, HashSet<String>)> = Vec::with_capacity(ranked.len());
        for r in ranked {
            let sh = shingles(&self.analyzer, &r.chunk.text, self.config.shingle_size);
            if let Some((dup_of, _)) = kept.iter().find(|(_, k)| jaccard(&sh, k) > threshold) {
                let (dropped, kept) = (r.chunk_id(), dup_of.chunk_id());
                debug!(dropped, kept, "near-duplicate suppressed");
                continue;
            }
            kept.push((r, sh));
        }
        kept.into_iter().map(|(r, _)| r).collect()
    }

    pub fn recency_factor(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let age_days = ((now - created_at).num_seconds().max(0) as f64) / 86_400.0;
        let half_life = self.config.recency_half_life_days;
        let factor = match self.config.recency_decay {
            RecencyDecay::Exponential => 0.5f64.powf(age_days / half_life),
            RecencyDecay::Linear => (1.0 - 0.5 * age_days / half_life).max(0.0),
        };
        factor as f32
    }

    fn apply_recency(&self, results: &mut [FusedResult], now: DateTime<Utc>) {
        for r in results {
            r.score *= self.recency_factor(r.chunk.created_at, now);
        }
    }

    fn apply_shape(&self, results: &mut [FusedResult], shape: &QueryShape) {
        for r in results {
            let mut boost = 1.0;
            if let Some(phrase) = &shape.phrase {
                if normalize_ws(&r.chunk.text).contains(phrase.as_str()) {
                    boost *= self.config.phrase_boost;
                }
            }
            if shape.code_like && r.chunk.text.contains("```") {
                boost *= self.config.code_boost;
            }
            if let (Some(header), Some(section)) = (&shape.header, r.chunk.section()) {
                let section = section.to_lowercase();
                if section.contains(header.as_str()) || header.contains(section.as_str()) {
                    boost *= self.config.header_boost;
                }
            }
            r.score *= boost;
        }
    }
}

/// Word n-grams of the analyzed text. Texts shorter than `n` words form one shingle.
pub fn shingles(analyzer: &Analyzer, text: &str, n: usize) -> HashSet<String> {
    let tokens = analyzer.tokenize(text);
    if tokens.is_empty() {
        return HashSet::new();
    }
    if tokens.len() < n {
        return HashSet::from([tokens.join(" ")]);
    }
    tokens.windows(n).map(|w| w.join(" ")).collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use recall_core::types::{Chunk, Meta, ScoreRank};
    use std::sync::Arc;

    fn result(id: &str, text: &str, score: f32, sim: Option<f32>) -> FusedResult {
        result_at(id, text, score, sim, Utc::now(), Meta::new())
    }

    fn result_at(
        id: &str,
        text: &str,
        score: f32,
        sim: Option<f32>,
        created_at: DateTime<Utc>,
        metadata: Meta,
    ) -> FusedResult {
        FusedResult {
            chunk: Arc::new(Chunk {
                chunk_id: id.to_string(),
                source_id: "notes.md".into(),
                start_offset: 0,
                end_offset: text.chars().count(),
                sequence_index: 0,
                total_chunks_in_source: 1,
                text: text.to_string(),
                created_at,
                metadata,
            }),
            score,
            lexical: None,
            vector: sim.map(|s| ScoreRank { score: s, rank: 1 }),
        }
    }

    fn only(config: RerankConfig) -> Reranker {
        Reranker::new(RerankConfig { shape_boost: false, ..config })
    }

    fn ids(v: &[FusedResult]) -> Vec<&str> {
        v.iter().map(|r| r.chunk_id()).collect()
    }

    #[test]
    fn floor_drops_low_similarity_but_keeps_lexical_only() {
        let rr = only(RerankConfig { diversity_threshold: None, ..RerankConfig::default() });
        let fused = vec![
            result("a", "alpha", 0.9, Some(0.9)),
            result("b", "bravo", 0.8, Some(0.4)),
            result("c", "charlie", 0.7, None),
            result("d", "delta", 0.6, Some(0.75)),
        ];
        let opts = RerankOptions { min_results: 2, ..RerankOptions::new(rr.config()) };
        assert_eq!(ids(&rr.rerank("q", fused, &opts)), vec!["a", "c", "d"]);
    }

    #[test]
    fn floor_relaxes_to_reach_min_results() {
        let rr = only(RerankConfig { diversity_threshold: None, ..RerankConfig::default() });
        let fused = vec![
            result("a", "alpha", 0.9, Some(0.65)),
            result("b", "bravo", 0.8, Some(0.55)),
            result("c", "charlie", 0.7, Some(0.1)),
        ];
        let opts = RerankOptions { min_results: 2, ..RerankOptions::new(rr.config()) };
        // 0.7 -> 0.6 keeps one, 0.5 keeps two.
        assert_eq!(ids(&rr.rerank("q", fused, &opts)), vec!["a", "b"]);
    }

    #[test]
    fn floor_is_skipped_for_degraded_queries() {
        let rr = only(RerankConfig { diversity_threshold: None, ..RerankConfig::default() });
        let fused =
            vec![result("a", "alpha", 0.9, Some(0.1)), result("b", "bravo", 0.8, Some(0.1))];
        let opts =
            RerankOptions { min_results: 0, degraded: true, ..RerankOptions::new(rr.config()) };
        assert_eq!(rr.rerank("q", fused, &opts).len(), 2);
    }

    #[test]
    fn unreachable_floors_terminate_and_keep_everything() {
        let rr = only(RerankConfig { diversity_threshold: None, ..RerankConfig::default() });
        for min_score in [f32::INFINITY, f32::NAN, 1.0e9, f32::NEG_INFINITY] {
            let fused =
                vec![result("a", "alpha", 0.9, Some(0.2)), result("b", "bravo", 0.8, Some(0.1))];
            let opts = RerankOptions {
                min_score: Some(min_score),
                min_results: 2,
                ..RerankOptions::new(rr.config())
            };
            assert_eq!(ids(&rr.rerank("q", fused, &opts)), vec!["a", "b"], "min_score {min_score}");
        }
    }

    #[test]
    fn smallest_relax_step_still_reaches_min_results() {
        let rr = only(RerankConfig {
            diversity_threshold: None,
            relax_step: MIN_RELAX_STEP,
            ..RerankConfig::default()
        });
        let fused =
            vec![result("a", "alpha", 0.9, Some(-0.9)), result("b", "bravo", 0.8, Some(-0.95))];
        let opts = RerankOptions {
            min_score: Some(1.0),
            min_results: 2,
            ..RerankOptions::new(rr.config())
        };
        assert_eq!(rr.rerank("q", fused, &opts).len(), 2);
    }

    #[test]
    fn floor_is_skipped_for_unbounded_metrics() {
        let config = RerankConfig { diversity_threshold: None, ..RerankConfig::default() };
        let fused = || {
            vec![
                result("a", "alpha", 0.9, Some(-0.4)),
                result("b", "bravo", 0.8, Some(-1.7)),
                result("c", "charlie", 0.7, Some(-3.2)),
                result("d", "delta", 0.6, Some(-8.0)),
            ]
        };
        let opts = RerankOptions { min_results: 1, ..RerankOptions::new(&config) };

        let euclidean = only(config).with_metric(SimilarityMetric::Euclidean);
        assert_eq!(ids(&euclidean.rerank("q", fused(), &opts)), vec!["a", "b", "c", "d"]);
        let dot = only(config).with_metric(SimilarityMetric::Dot);
        assert_eq!(dot.rerank("q", fused(), &opts).len(), 4);
        // The same similarities read as cosine fall below the floor.
        assert_eq!(ids(&only(config).rerank("q", fused(), &opts)), vec!["a"]);
    }

    #[test]
    fn near_duplicates_keep_only_higher_ranked() {
        let rr = only(RerankConfig { relevance_floor: None, ..RerankConfig::default() });
        let base = "water the tomatoes deeply twice a week during the hot dry summer months";
        let near = format!("{base} please");
        let a = shingles(&Analyzer::plain(), base, 3);
        let b = shingles(&Analyzer::plain(), &near, 3);
        assert!(jaccard(&a, &b) >= 0.9);

        let fused = vec![
            result("top", base, 0.9, None),
            result("dup", &near, 0.8, None),
            result("other", "bees swarm in late spring when the hive gets crowded", 0.7, None),
        ];
        let out = rr.rerank("q", fused, &RerankOptions::new(rr.config()));
        assert_eq!(ids(&out), vec!["top", "other"]);
    }

    #[test]
    fn recency_prefers_newer_chunks() {
        let rr = only(RerankConfig {
            relevance_floor: None,
            diversity_threshold: None,
            ..RerankConfig::default()
        });
        let now = Utc::now();
        let fused = vec![
            result_at("old", "old note", 1.0, None, now - Duration::days(60), Meta::new()),
            result_at("new", "new note", 0.9, None, now, Meta::new()),
        ];
        let opts = RerankOptions { recency: true, now, ..RerankOptions::new(rr.config()) };
        let out = rr.rerank("q", fused.clone(), &opts);
        assert_eq!(ids(&out), vec!["new", "old"]);
        assert!((out[1].score - 0.25).abs() < 1e-3);

        let off = RerankOptions { recency: false, now, ..RerankOptions::new(rr.config()) };
        assert_eq!(ids(&rr.rerank("q", fused, &off)), vec!["old", "new"]);
    }

    #[test]
    fn linear_decay_halves_at_half_life() {
        let rr =
            only(RerankConfig { recency_decay: RecencyDecay::Linear, ..RerankConfig::default() });
        let now = Utc::now();
        assert!((rr.recency_factor(now - Duration::days(30), now) - 0.5).abs() < 1e-4);
        assert_eq!(rr.recency_factor(now - Duration::days(90), now), 0.0);
        assert_eq!(rr.recency_factor(now + Duration::days(1), now), 1.0);
    }

    #[test]
    fn shape_detection() {
        let code = QueryShape::detect("fn main() {");
        assert!(code.code_like);
        assert!(code.header.is_none());

        assert_eq!(QueryShape::detect("## Pest Control").header.as_deref(), Some("pest control"));
        assert_eq!(QueryShape::detect("Pest Control").header.as_deref(), Some("pest control"));
        assert!(QueryShape::detect("how do I stop aphids").header.is_none());
        assert_eq!(QueryShape::detect("aphid  spray").phrase.as_deref(), Some("aphid spray"));
        assert!(QueryShape::detect("aphids").phrase.is_none());
    }

    #[test]
    fn shape_boosts_phrase_code_and_header() {
        let rr = Reranker::new(RerankConfig {
            relevance_floor: None,
            diversity_threshold: None,
            ..RerankConfig::default()
        });
        let mut section = Meta::new();
        section.insert("section".into(), "Pest Control".into());
        let now = Utc::now();
        let fused = vec![
            result("plain", "nothing relevant here", 1.0, None),
            result("phrase", "mix the Garlic  Spray weekly", 1.0, None),
            result_at("header", "neem oil works", 1.0, None, now, section),
            result("code", "```sh\nls\n```", 1.0, None),
        ];
        let opts = RerankOptions::new(rr.config());

        let out = rr.rerank("garlic spray", fused.clone(), &opts);
        assert_eq!(out[0].chunk_id(), "phrase");
        assert!((out[0].score - 1.2).abs() < 1e-6);

        let out = rr.rerank("Pest Control", fused.clone(), &opts);
        assert_eq!(out[0].chunk_id(), "header");

        let out = rr.rerank("ls()", fused, &opts);
        assert_eq!(out[0].chunk_id(), "code");
        assert!((out[0].score - 1.15).abs() < 1e-6);
    }
}
