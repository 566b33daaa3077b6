//! Domain types shared by the lexical, vector and hybrid engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type ChunkId = String;
pub type Meta = BTreeMap<String, String>;

/// A named source of text.
///
/// - `source_id`: stable identity (relative file path or logical name)
/// - `text`: the full body
/// - `last_modified`: used for change detection and as chunk `created_at`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub source_id: String,
    pub text: String,
    pub last_modified: DateTime<Utc>,
}

impl Document {
    pub fn new(
        source_id: impl Into<String>,
        text: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self { source_id: source_id.into(), text: text.into(), last_modified }
    }

    /// blake3 hex digest of the body.
    pub fn content_hash(&self) -> String {
        content_hash(&self.text)
    }
}

pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// A span of a source document that is independently indexed.
///
/// Offsets are character positions (not bytes) in the source. `chunk_id` is a
/// stable hash of `(source_id, start_offset)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub source_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub sequence_index: usize,
    pub total_chunks_in_source: usize,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Meta,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn citation(&self) -> Citation {
        Citation {
            source_id: self.source_id.clone(),
            start_offset: self.start_offset,
            end_offset: self.end_offset,
        }
    }

    /// Nearest markdown header preceding the chunk, if the source had any.
    pub fn section(&self) -> Option<&str> {
        self.metadata.get("section").map(String::as_str)
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.text)
    }
}

/// One embedding per chunk. `provider_tag` keeps vectors from incompatible
/// models from ever being compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: ChunkId,
    pub embedding: Vec<f32>,
    pub provider_tag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Dot,
    /// Negated L2 distance so that higher is still better.
    Euclidean,
}

/// Indicates which retrieval path produced a candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Vector,
    Lexical,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector => f.write_str("vector"),
            Self::Lexical => f.write_str("lexical"),
        }
    }
}

/// A chunk with its path-specific score and 1-based rank in that path's list.
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub chunk: Arc<Chunk>,
    pub score: f32,
    pub rank: usize,
    pub source: SourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRank {
    pub score: f32,
    pub rank: usize,
}

/// A fused chunk. The constituent scores and ranks are kept for explainability.
#[derive(Debug, Clone)]
pub struct FusedResult {
    pub chunk: Arc<Chunk>,
    pub score: f32,
    pub lexical: Option<ScoreRank>,
    pub vector: Option<ScoreRank>,
}

impl FusedResult {
    pub fn vector_similarity(&self) -> Option<f32> {
        self.vector.map(|v| v.score)
    }

    pub fn chunk_id(&self) -> &str {
        &self.chunk.chunk_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.source_id, self.start_offset, self.end_offset)
    }
}

/// Why a query returned less than both retrieval paths could offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Degradation {
    VectorUnavailable(String),
    VectorIndexCorrupted(String),
    LexicalIndexCorrupted(String),
    NoCandidates,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VectorUnavailable(d) => write!(f, "vector path unavailable: {d}"),
            Self::VectorIndexCorrupted(d) => write!(f, "vector index corrupted: {d}"),
            Self::LexicalIndexCorrupted(d) => write!(f, "lexical index corrupted: {d}"),
            Self::NoCandidates => f.write_str("no candidates from either path"),
        }
    }
}

/// Size limit for an assembled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeBudget {
    Chars(usize),
    /// Approximated as four characters per token.
    Tokens(usize),
}

impl SizeBudget {
    pub const CHARS_PER_TOKEN: usize = 4;

    pub fn max_chars(self) -> usize {
        match self {
            Self::Chars(n) => n,
            Self::Tokens(n) => n.saturating_mul(Self::CHARS_PER_TOKEN),
        }
    }
}

impl Default for SizeBudget {
    fn default() -> Self {
        Self::Chars(4000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub chunk_id: ChunkId,
    pub citation: Citation,
    pub text: String,
    pub score: f32,
}

/// Ordered, deduplicated passages whose concatenated size respects the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub passages: Vec<Passage>,
    pub total_chars: usize,
    pub budget: SizeBudget,
    pub degraded: bool,
    pub degradation: Option<Degradation>,
}

impl ContextBundle {
    pub fn empty(budget: SizeBudget, degradation: Option<Degradation>) -> Self {
        Self {
            passages: Vec::new(),
            total_chars: 0,
            budget,
            degraded: true,
            degradation: degradation.or(Some(Degradation::NoCandidates)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn citations(&self) -> impl Iterator<Item = &Citation> {
        self.passages.iter().map(|p| &p.citation)
    }

    /// Passages joined for a downstream prompt, each prefixed by `[n] source:start-end`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, p) in self.passages.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            out.push_str(&format!("[{}] {}\n", i + 1, p.citation));
            out.push_str(&p.text);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_budget_converts_to_chars() {
        assert_eq!(SizeBudget::Tokens(100).max_chars(), 400);
        assert_eq!(SizeBudget::Chars(250).max_chars(), 250);
    }

    #[test]
    fn empty_bundle_is_degraded() {
        let bundle = ContextBundle::empty(SizeBudget::Chars(10), None);
        assert!(bundle.degraded);
        assert_eq!(bundle.degradation, Some(Degradation::NoCandidates));
        assert!(bundle.render().is_empty());
    }

    #[test]
    fn render_prefixes_citations() {
        let bundle = ContextBundle {
            passages: vec![Passage {
                chunk_id: "c1".into(),
                citation: Citation { source_id: "a.md".into(), start_offset: 0, end_offset: 5 },
                text: "hello".into(),
                score: 1.0,
            }],
            total_chars: 5,
            budget: SizeBudget::Chars(10),
            degraded: false,
            degradation: None,
        };
        assert_eq!(bundle.render(), "[1] a.md:0-5\nhello");
    }
}
