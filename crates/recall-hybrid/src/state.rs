//! Index state committed under one lock: the chunk table, the lexical index and
//! per-source records. A chunk becomes visible to queries only once it is in
//! the chunk table, which happens in the same write as its postings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use recall_core::types::{Chunk, ChunkId};
use recall_text::LexicalIndex;

pub const CHUNKS_FILE: &str = "chunks.json";
pub const SOURCES_FILE: &str = "sources.json";
pub const LEXICAL_FILE: &str = "lexical.json";

/// What the engine remembers about an ingested source, used for change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub chunk_ids: Vec<ChunkId>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct IndexState {
    pub chunks: HashMap<ChunkId, Arc<Chunk>>,
    pub lexical: LexicalIndex,
    pub sources: BTreeMap<String, SourceRecord>,
}

impl IndexState {
    pub fn new(lexical: LexicalIndex) -> Self {
        Self { chunks: HashMap::new(), lexical, sources: BTreeMap::new() }
    }

    pub fn chunk(&self, id: &str) -> Option<&Arc<Chunk>> {
        self.chunks.get(id)
    }

    /// Drop `ids` from the chunk table and the lexical index.
    pub fn remove_chunks(&mut self, ids: &[ChunkId]) {
        for id in ids {
            self.chunks.remove(id);
            self.lexical.remove_chunk(id);
        }
    }
}
