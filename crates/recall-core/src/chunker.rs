//! Fixed-size character chunking with overlap.
//!
//! A source is walked in strides of `chunk_size - overlap` characters; each
//! chunk spans `[i, min(i + chunk_size, len))` and the walk stops once a chunk
//! reaches the end of the text. Offsets and overlap are measured in chars so
//! the same input always produces the same spans and ids.

use chrono::Utc;
use std::hash::Hasher;
use twox_hash::XxHash64;

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::types::{Chunk, ChunkId, Document, Meta};

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    /// Fails with `Error::Configuration` when `overlap >= chunk_size`.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn with_sizes(chunk_size: usize, overlap: usize) -> Result<Self> {
        Self::new(ChunkingConfig { chunk_size, overlap })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    fn stride(&self) -> usize {
        self.config.chunk_size - self.config.overlap
    }

    /// Number of chunks a text of `char_len` characters produces.
    pub fn count(&self, char_len: usize) -> usize {
        let size = self.config.chunk_size;
        if char_len == 0 {
            0
        } else if char_len <= size {
            1
        } else {
            1 + (char_len - size).div_ceil(self.stride())
        }
    }

    /// Lazily chunk a document. The iterator is cheap to clone, so it can be
    /// restarted without re-reading the source.
    pub fn chunk<'a>(&self, doc: &'a Document) -> Chunks<'a> {
        let mut byte_offsets: Vec<usize> = doc.text.char_indices().map(|(b, _)| b).collect();
        let char_len = byte_offsets.len();
        byte_offsets.push(doc.text.len());
        Chunks {
            doc,
            byte_offsets,
            sections: detect_sections(&doc.text),
            size: self.config.chunk_size,
            stride: self.stride(),
            total: self.count(char_len),
            char_len,
            next: 0,
        }
    }
}

/// Stable id for the chunk starting at `start_offset` in `source_id`.
/// Unchanged text re-ingested yields the same ids.
pub fn chunk_id(source_id: &str, start_offset: usize) -> ChunkId {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(source_id.as_bytes());
    hasher.write(&[0xff]);
    hasher.write(&(start_offset as u64).to_le_bytes());
    format!("{:016x}", hasher.finish())
}

/// Eager convenience over [`Chunker::chunk`]; chunks are stamped with the current time.
pub fn chunk(source_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    let chunker = Chunker::with_sizes(chunk_size, overlap)?;
    let doc = Document::new(source_id, text, Utc::now());
    Ok(chunker.chunk(&doc).collect())
}

#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    doc: &'a Document,
    byte_offsets: Vec<usize>,
    sections: Vec<(usize, String)>,
    size: usize,
    stride: usize,
    total: usize,
    char_len: usize,
    next: usize,
}

impl Chunks<'_> {
    pub fn total(&self) -> usize {
        self.total
    }

    fn section_for(&self, start: usize, end: usize) -> Option<&str> {
        let preceding = self.sections.iter().take_while(|(at, _)| *at <= start).last();
        preceding
            .or_else(|| self.sections.iter().find(|(at, _)| *at < end))
            .map(|(_, title)| title.as_str())
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.total {
            return None;
        }
        let sequence_index = self.next;
        let start = sequence_index * self.stride;
        let end = (start + self.size).min(self.char_len);
        let text = &self.doc.text[self.byte_offsets[start]..self.byte_offsets[end]];

        let mut metadata = Meta::new();
        metadata.insert("word_count".to_string(), text.split_whitespace().count().to_string());
        if let Some(section) = self.section_for(start, end) {
            metadata.insert("section".to_string(), section.to_string());
        }

        self.next += 1;
        Some(Chunk {
            chunk_id: chunk_id(&self.doc.source_id, start),
            source_id: self.doc.source_id.clone(),
            start_offset: start,
            end_offset: end,
            sequence_index,
            total_chunks_in_source: self.total,
            text: text.to_string(),
            created_at: self.doc.last_modified,
            metadata,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Markdown headers (`#` to `######`) with their char offsets.
fn detect_sections(text: &str) -> Vec<(usize, String)> {
    let mut sections = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            let rest = &trimmed[hashes..];
            if rest.starts_with(' ') || rest.starts_with('\t') {
                let title = rest.trim();
                if !title.is_empty() {
                    sections.push((offset, title.to_string()));
                }
            }
        }
        offset += line.chars().count();
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use proptest::prelude::*;

    fn doc(text: &str) -> Document {
        Document::new("notes/a.md", text, Utc::now())
    }

    #[test]
    fn three_thousand_chars_yield_five_overlapping_chunks() {
        let text: String = (0..3000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunker = Chunker::with_sizes(800, 100).expect("chunker");
        let d = doc(&text);
        let chunks: Vec<Chunk> = chunker.chunk(&d).collect();
        let spans: Vec<(usize, usize)> =
            chunks.iter().map(|c| (c.start_offset, c.end_offset)).collect();
        assert_eq!(spans, vec![(0, 800), (700, 1500), (1400, 2200), (2100, 2900), (2800, 3000)]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i);
            assert_eq!(c.total_chunks_in_source, 5);
            assert_eq!(c.text.chars().count(), c.end_offset - c.start_offset);
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunker = Chunker::with_sizes(800, 100).expect("chunker");
        let d = doc("a short note");
        let chunks: Vec<Chunk> = chunker.chunk(&d).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a short note");
        assert_eq!((chunks[0].start_offset, chunks[0].end_offset), (0, 12));
    }

    #[test]
    fn exact_size_text_is_one_chunk() {
        let chunker = Chunker::with_sizes(10, 2).expect("chunker");
        let d = doc("0123456789");
        assert_eq!(chunker.chunk(&d).count(), 1);
    }

    #[test]
    fn empty_text_yields_nothing() {
        let chunker = Chunker::with_sizes(800, 100).expect("chunker");
        let d = doc("");
        assert_eq!(chunker.chunk(&d).count(), 0);
    }

    #[test]
    fn overlap_at_least_chunk_size_is_configuration_error() {
        assert!(matches!(Chunker::with_sizes(100, 100), Err(Error::Configuration(_))));
        assert!(matches!(Chunker::with_sizes(100, 250), Err(Error::Configuration(_))));
        assert!(matches!(chunk("s", "text", 0, 0), Err(Error::Configuration(_))));
    }

    #[test]
    fn offsets_are_characters_not_bytes() {
        let text = "ééééé".repeat(4);
        let chunker = Chunker::with_sizes(8, 2).expect("chunker");
        let d = doc(&text);
        let chunks: Vec<Chunk> = chunker.chunk(&d).collect();
        assert_eq!(chunks[0].text.chars().count(), 8);
        assert_eq!(chunks[1].start_offset, 6);
        assert_eq!(chunks.last().map(|c| c.end_offset), Some(20));
    }

    #[test]
    fn iterator_is_restartable() {
        let chunker = Chunker::with_sizes(50, 10).expect("chunker");
        let d = doc(&"lorem ipsum dolor sit amet ".repeat(20));
        let iter = chunker.chunk(&d);
        let first: Vec<Chunk> = iter.clone().collect();
        let second: Vec<Chunk> = iter.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn sections_and_word_counts_are_recorded() {
        let text = "# Garden\nTomatoes need sun.\n## Pests\nAphids hate garlic spray.\n";
        let chunker = Chunker::with_sizes(30, 5).expect("chunker");
        let d = doc(text);
        let chunks: Vec<Chunk> = chunker.chunk(&d).collect();
        assert_eq!(chunks[0].section(), Some("Garden"));
        assert_eq!(chunks.last().and_then(|c| c.section()), Some("Pests"));
        assert_eq!(chunks[0].metadata.get("word_count").map(String::as_str), Some("6"));
    }

    #[test]
    fn chunk_id_depends_on_source_and_offset() {
        assert_eq!(chunk_id("a", 0), chunk_id("a", 0));
        assert_ne!(chunk_id("a", 0), chunk_id("a", 700));
        assert_ne!(chunk_id("a", 0), chunk_id("b", 0));
        assert_eq!(chunk_id("a", 0).len(), 16);
    }

    proptest! {
        #[test]
        fn chunking_is_deterministic(
            text in "[a-z .\n]{0,400}",
            size in 2usize..120,
            overlap_frac in 0.0f64..0.95,
        ) {
            let overlap = ((size as f64) * overlap_frac) as usize;
            prop_assume!(overlap < size);
            let a = chunk("src", &text, size, overlap).expect("valid");
            let b = chunk("src", &text, size, overlap).expect("valid");
            let key = |c: &Chunk| {
                (c.chunk_id.clone(), c.start_offset, c.end_offset, c.text.clone())
            };
            let a: Vec<_> = a.iter().map(key).collect();
            let b: Vec<_> = b.iter().map(key).collect();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn consecutive_chunks_overlap_by_configured_amount(
            text in "[a-z ]{1,600}",
            size in 2usize..100,
            overlap_frac in 0.0f64..0.95,
        ) {
            let overlap = ((size as f64) * overlap_frac) as usize;
            prop_assume!(overlap < size);
            let chunks = chunk("src", &text, size, overlap).expect("valid");
            prop_assert_eq!(chunks.last().map(|c| c.end_offset), Some(text.chars().count()));
            for pair in chunks.windows(2) {
                // The final chunk may be shorter, never the one before it.
                prop_assert_eq!(pair[0].end_offset - pair[1].start_offset, overlap);
                prop_assert_eq!(pair[0].end_offset - pair[0].start_offset, size);
            }
        }
    }
}
