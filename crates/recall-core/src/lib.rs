//! recall-core
//!
//! Domain types, error taxonomy, chunking, document loading, configuration and
//! the seams (`EmbedProvider`, `VectorStore`) shared by the lexical, vector and
//! hybrid crates.

pub mod chunker;
pub mod config;
pub mod error;
pub mod loader;
pub mod traits;
pub mod types;

pub use chunker::{chunk, chunk_id, Chunker, Chunks};
pub use error::{Error, Result};
pub use types::{
    Chunk, ChunkId, Citation, ContextBundle, Degradation, Document, FusedResult, Meta, Passage,
    RetrievalCandidate, ScoreRank, SimilarityMetric, SizeBudget, SourceKind, VectorRecord,
};
