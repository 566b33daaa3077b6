pub mod assemble;
pub mod engine;
pub mod fusion;
pub mod options;
pub mod planner;
pub mod rerank;
pub mod state;

pub use assemble::assemble;
pub use engine::HybridEngine;
pub use fusion::{fuse, rank_order};
pub use options::{
    EngineStats, IngestReport, RetrieveOptions, SearchOptions, SearchOutcome, Weights,
};
pub use planner::{Plan, PlanLimits, QueryPlanner};
pub use rerank::{QueryShape, RerankOptions, Reranker};
pub use state::{IndexState, SourceRecord};
