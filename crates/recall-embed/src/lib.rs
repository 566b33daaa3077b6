//! recall-embed
//!
//! Concrete [`EmbedProvider`]s. Real model backends live outside this
//! workspace and plug in through the same trait.

pub mod hashing;

use std::sync::Arc;
use tracing::info;

use recall_core::config::EmbedConfig;
use recall_core::error::{Error, Result};
use recall_core::traits::EmbedProvider;

pub use hashing::{l2_normalize, HashEmbedder};

/// Build the provider named by `config.provider`.
///
/// `APP_USE_FAKE_EMBEDDINGS=1` forces the hashing provider regardless of
/// configuration.
pub fn get_default_embedder(config: &EmbedConfig) -> Result<Arc<dyn EmbedProvider>> {
    let use_fake = std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if use_fake || config.provider == "hash" {
        info!(dim = config.dim, forced = use_fake, "using hashing embedder");
        return Ok(Arc::new(HashEmbedder::new(config.dim)?));
    }
    Err(Error::config(format!("unknown embedding provider '{}'", config.provider)))
}
