use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Embedding provider '{provider}' failed: {message}")]
    EmbeddingProvider { provider: String, message: String },

    #[error("Embedding provider '{provider}' timed out after {after_ms} ms")]
    Timeout { provider: String, after_ms: u64 },

    /// Read-time inconsistency between postings, chunks and vectors. The
    /// affected source should be fully re-indexed.
    #[error("Index corruption in {index} index: {detail}")]
    IndexCorruption {
        index: &'static str,
        source_id: Option<String>,
        detail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn provider(provider: impl Into<String>, message: impl ToString) -> Self {
        Self::EmbeddingProvider { provider: provider.into(), message: message.to_string() }
    }

    pub fn corruption(
        index: &'static str,
        source_id: Option<&str>,
        detail: impl Into<String>,
    ) -> Self {
        Self::IndexCorruption {
            index,
            source_id: source_id.map(str::to_string),
            detail: detail.into(),
        }
    }

    /// Provider failures and timeouts are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EmbeddingProvider { .. } | Self::Timeout { .. })
    }

    /// Source id that should be re-indexed, when the error names one.
    pub fn affected_source(&self) -> Option<&str> {
        match self {
            Self::IndexCorruption { source_id, .. } => source_id.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
