//! recall-vector
//!
//! Vector side of the hybrid engine: batched embedding with retry and backoff,
//! `embedding_failed` tracking, an embedding cache, similarity metrics and the
//! stores records live in. Enable the `lance` feature for a LanceDB-backed store.

pub mod cache;
pub mod indexer;
#[cfg(feature = "lance")]
pub mod lance;
pub mod similarity;
pub mod store;

pub use cache::{CacheEntry, EmbeddingCache};
pub use indexer::{EmbedReport, FailedEmbedding, StagedVectors, VectorIndexer, VectorStats};
#[cfg(feature = "lance")]
pub use lance::LanceVectorStore;
pub use store::InMemoryVectorStore;
