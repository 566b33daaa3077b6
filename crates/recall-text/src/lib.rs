//! recall-text
//!
//! Lexical side of the hybrid engine: a tantivy analyzer for tokenization and
//! an incremental inverted index scored with BM25.

pub mod analyzer;
pub mod index;

pub use analyzer::Analyzer;
pub use index::{DocEntry, LexicalIndex};
