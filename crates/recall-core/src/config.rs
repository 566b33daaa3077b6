//! Configuration loader, typed engine settings and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars.
//! Nested keys in env vars are separated by `__`
//! (`APP_ENGINE__CHUNKING__CHUNK_SIZE=1200`).
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::SimilarityMetric;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.engine()?;
        Ok(config)
    }

    /// Build from an inline TOML document; used by tests and embedders of the library.
    pub fn from_toml_str(toml: &str) -> Self {
        Self { figment: Figment::new().merge(Toml::string(toml)) }
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    pub fn get_or<T>(&self, key: &str, default: T) -> T
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment.extract_inner(key).unwrap_or(default)
    }

    /// The `engine` table merged over defaults, validated.
    pub fn engine(&self) -> anyhow::Result<EngineConfig> {
        let engine = match self.figment.find_value("engine") {
            Ok(_) => self.get::<EngineConfig>("engine")?,
            Err(_) => EngineConfig::default(),
        };
        engine.validate()?;
        Ok(engine)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub lexical: LexicalConfig,
    pub vector: VectorConfig,
    pub embed: EmbedConfig,
    pub planner: PlannerConfig,
    pub fusion: FusionConfig,
    pub rerank: RerankConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        self.lexical.validate()?;
        self.vector.validate()?;
        self.embed.validate()?;
        self.fusion.validate()?;
        self.rerank.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive chunks.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_size: 800, overlap: 100 }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be greater than zero"));
        }
        if self.overlap >= self.chunk_size {
            return Err(Error::config(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalConfig {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length normalization.
    pub b: f32,
    pub stop_words: bool,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75, stop_words: true }
    }
}

impl LexicalConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.k1 > 0.0) {
            return Err(Error::config(format!("bm25 k1 must be positive, got {}", self.k1)));
        }
        if !(0.0..=1.0).contains(&self.b) {
            return Err(Error::config(format!("bm25 b must be within [0, 1], got {}", self.b)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub timeout_ms: u64,
    pub metric: SimilarityMetric,
    pub cache_capacity: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            initial_backoff_ms: 200,
            timeout_ms: 30_000,
            metric: SimilarityMetric::Cosine,
            cache_capacity: 50_000,
        }
    }
}

impl VectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("vector batch_size must be greater than zero"));
        }
        if self.timeout_ms == 0 {
            return Err(Error::config("embedding timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Provider name understood by `recall_embed::get_default_embedder`.
    pub provider: String,
    pub dim: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self { provider: "hash".to_string(), dim: 384 }
    }
}

impl EmbedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(Error::config("embedding dim must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub vector_limit: usize,
    pub lexical_limit: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { vector_limit: 20, lexical_limit: 20 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    /// Reciprocal rank fusion.
    #[default]
    Rrf,
    Weighted,
    Max,
}

impl std::str::FromStr for FusionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rrf" => Ok(Self::Rrf),
            "weighted" => Ok(Self::Weighted),
            "max" => Ok(Self::Max),
            other => Err(Error::config(format!("unknown fusion method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    MinMax,
    /// Raw path scores; BM25 and similarity ranges are then not comparable.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub method: FusionMethod,
    pub rrf_k: f32,
    pub vector_weight: f32,
    pub lexical_weight: f32,
    pub normalization: Normalization,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::Rrf,
            rrf_k: 60.0,
            vector_weight: 0.5,
            lexical_weight: 0.5,
            normalization: Normalization::MinMax,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.rrf_k >= 0.0) {
            return Err(Error::config(format!("rrf_k must be non-negative, got {}", self.rrf_k)));
        }
        if !(self.vector_weight >= 0.0 && self.lexical_weight >= 0.0) {
            return Err(Error::config("fusion weights must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecencyDecay {
    #[default]
    Exponential,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    /// Minimum vector similarity; `None` disables the stage.
    pub relevance_floor: Option<f32>,
    pub min_results: usize,
    pub relax_step: f32,
    /// Shingle Jaccard above which a lower-ranked chunk is dropped; `None` disables.
    pub diversity_threshold: Option<f32>,
    pub shingle_size: usize,
    pub recency_half_life_days: f64,
    pub recency_decay: RecencyDecay,
    pub phrase_boost: f32,
    pub code_boost: f32,
    pub header_boost: f32,
    pub shape_boost: bool,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            relevance_floor: Some(0.7),
            min_results: 3,
            relax_step: 0.1,
            diversity_threshold: Some(0.85),
            shingle_size: 3,
            recency_half_life_days: 30.0,
            recency_decay: RecencyDecay::Exponential,
            phrase_boost: 1.2,
            code_boost: 1.15,
            header_boost: 1.1,
            shape_boost: true,
        }
    }
}

/// Smallest step that still moves the floor within a few thousand rounds.
pub const MIN_RELAX_STEP: f32 = 1e-3;

impl RerankConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(floor) = self.relevance_floor {
            if !(-1.0..=1.0).contains(&floor) {
                let msg = format!("relevance_floor must be within [-1, 1], got {floor}");
                return Err(Error::config(msg));
            }
        }
        if !(MIN_RELAX_STEP..=2.0).contains(&self.relax_step) {
            let step = self.relax_step;
            let msg = format!("relax_step must be within [{MIN_RELAX_STEP}, 2], got {step}");
            return Err(Error::config(msg));
        }
        if let Some(t) = self.diversity_threshold {
            if !(t > 0.0 && t <= 1.0) {
                let msg = format!("diversity_threshold must be within (0, 1], got {t}");
                return Err(Error::config(msg));
            }
        }
        if self.shingle_size == 0 {
            return Err(Error::config("shingle_size must be greater than zero"));
        }
        if !(self.recency_half_life_days > 0.0) {
            return Err(Error::config("recency_half_life_days must be positive"));
        }
        for (name, boost) in [
            ("phrase_boost", self.phrase_boost),
            ("code_boost", self.code_boost),
            ("header_boost", self.header_boost),
        ] {
            if !(boost > 0.0) {
                return Err(Error::config(format!("{name} must be positive, got {boost}")));
            }
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() {
        p
    } else {
        base.join(p)
    }
}
