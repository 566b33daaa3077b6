//! In-memory inverted index with BM25 scoring.
//!
//! Postings map each term to the chunks containing it with their term
//! frequencies. Per-chunk entries keep the token length and the unique terms so
//! that removal touches only the postings the chunk contributed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;

use recall_core::config::LexicalConfig;
use recall_core::error::{Error, Result};
use recall_core::types::{Chunk, ChunkId};

use crate::analyzer::Analyzer;

const INDEX: &str = "lexical";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocEntry {
    pub source_id: String,
    /// Token count after analysis.
    pub length: u32,
    /// Unique terms, so removal can walk exactly this chunk's postings.
    pub terms: Vec<String>,
    pub content_hash: String,
}

/// Serializable form of [`LexicalIndex`]; derived statistics are rebuilt on load.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    params: LexicalConfig,
    docs: BTreeMap<ChunkId, DocEntry>,
    postings: BTreeMap<String, BTreeMap<ChunkId, u32>>,
}

#[derive(Debug, Clone)]
pub struct LexicalIndex {
    analyzer: Analyzer,
    params: LexicalConfig,
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    docs: HashMap<ChunkId, DocEntry>,
    by_source: HashMap<String, BTreeSet<ChunkId>>,
    total_len: u64,
}

impl LexicalIndex {
    pub fn new(params: LexicalConfig) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            analyzer: Analyzer::new(params.stop_words),
            params,
            postings: HashMap::new(),
            docs: HashMap::new(),
            by_source: HashMap::new(),
            total_len: 0,
        })
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn params(&self) -> LexicalConfig {
        self.params
    }

    /// Insert or update postings for one chunk. Returns `false` when the chunk is
    /// already indexed with identical text.
    pub fn add(&mut self, chunk: &Chunk) -> bool {
        let hash = chunk.content_hash();
        if let Some(existing) = self.docs.get(&chunk.chunk_id) {
            if existing.content_hash == hash {
                return false;
            }
            self.remove_chunk(&chunk.chunk_id);
        }

        let mut tf: BTreeMap<String, u32> = BTreeMap::new();
        let tokens = self.analyzer.tokenize(&chunk.text);
        for t in &tokens {
            *tf.entry(t.clone()).or_insert(0) += 1;
        }
        for (term, freq) in &tf {
            self.postings.entry(term.clone()).or_default().insert(chunk.chunk_id.clone(), *freq);
        }

        let length = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        self.total_len += u64::from(length);
        self.docs.insert(
            chunk.chunk_id.clone(),
            DocEntry {
                source_id: chunk.source_id.clone(),
                length,
                terms: tf.into_keys().collect(),
                content_hash: hash,
            },
        );
        self.by_source.entry(chunk.source_id.clone()).or_default().insert(chunk.chunk_id.clone());
        debug!(chunk_id = %chunk.chunk_id, tokens = length, "indexed chunk postings");
        true
    }

    pub fn remove_chunk(&mut self, chunk_id: &str) -> bool {
        let Some(entry) = self.docs.remove(chunk_id) else {
            return false;
        };
        for term in &entry.terms {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(chunk_id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_len = self.total_len.saturating_sub(u64::from(entry.length));
        if let Some(ids) = self.by_source.get_mut(&entry.source_id) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.by_source.remove(&entry.source_id);
            }
        }
        true
    }

    /// Remove postings for every chunk of `source_id`; returns the removed ids.
    pub fn remove_source(&mut self, source_id: &str) -> Vec<ChunkId> {
        let ids: Vec<ChunkId> =
            self.by_source.get(source_id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        for id in &ids {
            self.remove_chunk(id);
        }
        ids
    }

    /// BM25 over already-analyzed terms. Repeated query terms count once.
    ///
    /// Results are ordered by score descending, then chunk id ascending. A
    /// posting that points at an unknown chunk is reported as corruption.
    pub fn score(&self, query_terms: &[String], limit: usize) -> Result<Vec<(ChunkId, f32)>> {
        if query_terms.is_empty() || limit == 0 || self.docs.is_empty() {
            return Ok(Vec::new());
        }
        let n = self.docs.len() as f32;
        let avg_len = self.avg_len();
        if avg_len <= 0.0 {
            // Only empty chunks are indexed; nothing can match.
            return Ok(Vec::new());
        }
        let k1 = self.params.k1;
        let b = self.params.b;

        let mut seen = HashSet::new();
        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in query_terms {
            if !seen.insert(term.as_str()) {
                continue;
            }
            let Some(list) = self.postings.get(term) else { continue };
            let df = list.len() as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (chunk_id, tf) in list {
                let Some(doc) = self.docs.get(chunk_id) else {
                    return Err(Error::corruption(
                        INDEX,
                        None,
                        format!("posting for term '{term}' references unknown chunk {chunk_id}"),
                    ));
                };
                let tf = *tf as f32;
                let norm = 1.0 - b + b * (doc.length as f32 / avg_len);
                let weight = idf * (tf * (k1 + 1.0)) / (tf + k1 * norm);
                *scores.entry(chunk_id.as_str()).or_insert(0.0) += weight;
            }
        }

        let mut ranked: Vec<(ChunkId, f32)> =
            scores.into_iter().map(|(id, s)| (id.to_string(), s)).collect();
        ranked.sort_by(by_score_then_id);
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Tokenize `query` and score it. A query with no recognized terms returns nothing.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(ChunkId, f32)>> {
        let terms = self.analyzer.tokenize(query);
        self.score(&terms, limit)
    }

    pub fn df(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, HashMap::len)
    }

    pub fn tf(&self, term: &str, chunk_id: &str) -> u32 {
        self.postings.get(term).and_then(|l| l.get(chunk_id)).copied().unwrap_or(0)
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn posting_count(&self) -> usize {
        self.postings.values().map(HashMap::len).sum()
    }

    pub fn avg_len(&self) -> f32 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f32 / self.docs.len() as f32
        }
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.docs.contains_key(chunk_id)
    }

    pub fn doc(&self, chunk_id: &str) -> Option<&DocEntry> {
        self.docs.get(chunk_id)
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &ChunkId> {
        self.docs.keys()
    }

    pub fn source_chunks(&self, source_id: &str) -> Vec<ChunkId> {
        self.by_source.get(source_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Cross-check postings, per-chunk entries and running totals.
    pub fn verify(&self) -> Result<()> {
        for (term, list) in &self.postings {
            if list.is_empty() {
                let detail = format!("empty posting list for '{term}'");
                return Err(Error::corruption(INDEX, None, detail));
            }
            for chunk_id in list.keys() {
                let Some(doc) = self.docs.get(chunk_id) else {
                    return Err(Error::corruption(
                        INDEX,
                        None,
                        format!("posting for term '{term}' references unknown chunk {chunk_id}"),
                    ));
                };
                if !doc.terms.iter().any(|t| t == term) {
                    return Err(Error::corruption(
                        INDEX,
                        Some(&doc.source_id),
                        format!("chunk {chunk_id} has a posting for '{term}' it never contained"),
                    ));
                }
            }
        }
        let mut total = 0u64;
        for (chunk_id, doc) in &self.docs {
            total += u64::from(doc.length);
            for term in &doc.terms {
                if !self.postings.get(term).is_some_and(|l| l.contains_key(chunk_id)) {
                    return Err(Error::corruption(
                        INDEX,
                        Some(&doc.source_id),
                        format!("chunk {chunk_id} is missing its posting for '{term}'"),
                    ));
                }
            }
            if !self.by_source.get(&doc.source_id).is_some_and(|ids| ids.contains(chunk_id)) {
                return Err(Error::corruption(
                    INDEX,
                    Some(&doc.source_id),
                    format!("chunk {chunk_id} is not listed under its source"),
                ));
            }
        }
        if total != self.total_len {
            return Err(Error::corruption(
                INDEX,
                None,
                format!("length total {} disagrees with chunk lengths {total}", self.total_len),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            params: self.params,
            docs: self.docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            postings: self
                .postings
                .iter()
                .map(|(term, list)| {
                    (term.clone(), list.iter().map(|(k, v)| (k.clone(), *v)).collect())
                })
                .collect(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(&snapshot)?)?;
        Ok(())
    }

    /// Load a snapshot written by [`LexicalIndex::save`]. The stored BM25
    /// parameters win over the defaults so scores stay reproducible.
    pub fn load(path: &Path) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_slice(&fs::read(path)?)?;
        let mut index = Self::new(snapshot.params)?;
        for (chunk_id, doc) in snapshot.docs {
            index.total_len += u64::from(doc.length);
            index.by_source.entry(doc.source_id.clone()).or_default().insert(chunk_id.clone());
            index.docs.insert(chunk_id, doc);
        }
        index.postings = snapshot
            .postings
            .into_iter()
            .map(|(term, list)| (term, list.into_iter().collect()))
            .collect();
        Ok(index)
    }

    #[cfg(test)]
    pub(crate) fn inject_posting(&mut self, term: &str, chunk_id: &str, tf: u32) {
        self.postings.entry(term.to_string()).or_default().insert(chunk_id.to_string(), tf);
    }
}

/// Score descending, then chunk id ascending.
pub fn by_score_then_id(a: &(ChunkId, f32), b: &(ChunkId, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use recall_core::chunker::chunk_id;

    fn mk(source: &str, start: usize, text: &str) -> Chunk {
        Chunk {
            chunk_id: chunk_id(source, start),
            source_id: source.to_string(),
            start_offset: start,
            end_offset: start + text.chars().count(),
            sequence_index: 0,
            total_chunks_in_source: 1,
            text: text.to_string(),
            created_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    fn index() -> LexicalIndex {
        LexicalIndex::new(LexicalConfig::default()).expect("index")
    }

    #[test]
    fn bm25_matches_hand_computed_score() {
        let mut idx = index();
        let a = mk("a", 0, "tomato tomato basil");
        let b = mk("b", 0, "pepper basil onion garlic");
        idx.add(&a);
        idx.add(&b);

        let hits = idx.search("tomato", 10).expect("search");
        assert_eq!(hits.len(), 1);
        // N=2, df=1, len=3, avg=3.5
        let idf = (1.0f32 + (2.0 - 1.0 + 0.5) / 1.5).ln();
        let norm = 1.0 - 0.75 + 0.75 * (3.0 / 3.5);
        let expected = idf * (2.0 * 2.2) / (2.0 + 1.2 * norm);
        assert!((hits[0].1 - expected).abs() < 1e-5, "{} vs {expected}", hits[0].1);
    }

    #[test]
    fn empty_query_returns_empty_list() {
        let mut idx = index();
        idx.add(&mk("a", 0, "seed starting under lights"));
        assert!(idx.search("", 10).expect("search").is_empty());
        assert!(idx.search("the and of", 10).expect("search").is_empty());
        assert!(idx.score(&[], 10).expect("score").is_empty());
    }

    #[test]
    fn re_adding_identical_chunk_is_noop() {
        let mut idx = index();
        let c = mk("a", 0, "compost needs nitrogen and carbon");
        assert!(idx.add(&c));
        let postings = idx.posting_count();
        assert!(!idx.add(&c));
        assert_eq!(idx.posting_count(), postings);
        assert_eq!(idx.doc_count(), 1);
    }

    #[test]
    fn changed_text_under_same_id_replaces_postings() {
        let mut idx = index();
        idx.add(&mk("a", 0, "rain barrel overflow"));
        assert!(idx.add(&mk("a", 0, "solar panel wiring")));
        assert_eq!(idx.df("rain"), 0);
        assert_eq!(idx.df("solar"), 1);
        idx.verify().expect("consistent");
    }

    #[test]
    fn remove_source_drops_all_its_postings() {
        let mut idx = index();
        idx.add(&mk("a", 0, "chicken coop ventilation"));
        idx.add(&mk("a", 700, "coop predator proofing"));
        idx.add(&mk("b", 0, "goat fencing"));
        let removed = idx.remove_source("a");
        assert_eq!(removed.len(), 2);
        assert_eq!(idx.df("coop"), 0);
        assert_eq!(idx.doc_count(), 1);
        assert!((idx.avg_len() - 2.0).abs() < f32::EPSILON);
        idx.verify().expect("consistent");
    }

    #[test]
    fn ties_break_by_chunk_id() {
        let mut idx = index();
        idx.add(&mk("x", 0, "honey bees"));
        idx.add(&mk("y", 0, "honey bees"));
        let hits = idx.search("honey", 10).expect("search");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].0 < hits[1].0);
        assert_eq!(hits[0].1, hits[1].1);
    }

    #[test]
    fn dangling_posting_is_corruption() {
        let mut idx = index();
        idx.add(&mk("a", 0, "water filter"));
        idx.inject_posting("water", "ghost", 1);
        assert!(matches!(idx.search("water", 5), Err(Error::IndexCorruption { .. })));
        assert!(matches!(idx.verify(), Err(Error::IndexCorruption { .. })));
    }

    #[test]
    fn snapshot_roundtrip_preserves_scores() {
        let tmp = tempfile::tempdir().expect("tmp");
        let path = tmp.path().join("lexical.json");
        let mut idx = index();
        idx.add(&mk("a", 0, "wood stove chimney cleaning"));
        idx.add(&mk("b", 0, "chimney cap install"));
        idx.save(&path).expect("save");

        let loaded = LexicalIndex::load(&path).expect("load");
        loaded.verify().expect("consistent");
        assert_eq!(loaded.search("chimney", 5).expect("a"), idx.search("chimney", 5).expect("b"));
        assert_eq!(loaded.source_chunks("a"), idx.source_chunks("a"));
    }

    proptest! {
        #[test]
        fn bm25_is_monotonic_in_term_frequency(
            tf in 1usize..20,
            extra in 0usize..20,
            others in 0usize..5,
        ) {
            let len = 20 + extra;
            let build = |tf: usize| {
                let mut idx = index();
                let mut words: Vec<String> = (0..tf).map(|_| "apple".to_string()).collect();
                words.extend((tf..len).map(|i| format!("w{i}")));
                idx.add(&mk("target", 0, &words.join(" ")));
                for o in 0..others {
                    idx.add(&mk("other", o, &format!("pear plum w{o} apple")));
                }
                idx.search("apple", 10).expect("search")
                    .into_iter()
                    .find(|(id, _)| *id == chunk_id("target", 0))
                    .map(|(_, s)| s)
                    .unwrap_or(0.0)
            };
            prop_assume!(tf + 1 <= len);
            prop_assert!(build(tf + 1) >= build(tf));
        }
    }
}
