//! Engine configuration.
//!
//! Layered: [`SemanticConfig::default`] → optional TOML file → environment
//! (`LORE_*`, read through `dotenvy` so a `.env` file also applies).
//!
//! | Field | Default | Env |
//! |---|---|---|
//! | `enabled` | `true` | `LORE_SEMANTIC` |
//! | `data_dir` | platform data dir | `LORE_DATA_DIR` |
//! | `cache_dir` | `<data_dir>/cache` | `LORE_CACHE_DIR` |
//! | `embedder` | `auto` | `LORE_EMBEDDER` |
//! | `dimension` | `384` | `LORE_EMBED_DIM` |
//! | `index_ttl_secs` | `3600` | `LORE_INDEX_TTL_SECS` |
//! | `analysis_ttl_secs` | `86400` | `LORE_ANALYSIS_TTL_SECS` |
//! | `max_results_per_namespace` | unbounded | `LORE_MAX_RESULTS` |
//! | `top_k` | `10` | `LORE_TOP_K` |
//! | `min_score` | `0.3` | `LORE_MIN_SCORE` |
//! | `query_timeout_ms` | none | `LORE_QUERY_TIMEOUT_MS` |
//! | `lock_timeout_ms` | `5000` | `LORE_LOCK_TIMEOUT_MS` |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::search::embedder_registry::AUTO_EMBEDDER;
use crate::search::embedder_service::EmbedderSignature;
use crate::search::hash_embedder::DEFAULT_DIMENSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Feature flag; a disabled engine answers every call with `FeatureDisabled`.
    pub enabled: bool,
    /// Root holding `models/` (and `cache/` unless `cache_dir` is set).
    pub data_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    /// `auto`, `hash`, or a registered model name.
    pub embedder: String,
    /// Hash embedder dimension.
    pub dimension: usize,
    pub index_ttl_secs: u64,
    /// TTL for derived analyses stored through [`crate::cache::ResultCache`].
    pub analysis_ttl_secs: u64,
    pub max_results_per_namespace: Option<usize>,
    pub top_k: usize,
    pub min_score: f32,
    pub query_timeout_ms: Option<u64>,
    pub lock_timeout_ms: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: default_data_dir(),
            cache_dir: None,
            embedder: AUTO_EMBEDDER.to_string(),
            dimension: DEFAULT_DIMENSION,
            index_ttl_secs: 3600,
            analysis_ttl_secs: 86_400,
            max_results_per_namespace: None,
            top_k: 10,
            min_score: 0.3,
            query_timeout_ms: None,
            lock_timeout_ms: 5000,
        }
    }
}

impl SemanticConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_embedder(mut self, embedder: impl Into<String>) -> Self {
        self.embedder = embedder.into();
        self
    }

    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        Ok(base.apply_env())
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid semantic config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_score) {
            anyhow::bail!("min_score must be within [0, 1], got {}", self.min_score);
        }
        if self.dimension == 0 {
            anyhow::bail!("dimension must be positive");
        }
        Ok(())
    }

    /// Overlay `LORE_*` environment variables. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(mut self) -> Self {
        if let Some(raw) = env_string("LORE_SEMANTIC") {
            match parse_flag(&raw) {
                Some(enabled) => self.enabled = enabled,
                None => warn!(var = "LORE_SEMANTIC", value = %raw, "ignoring invalid flag"),
            }
        }
        if let Some(dir) = env_string("LORE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("LORE_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(embedder) = env_string("LORE_EMBEDDER") {
            self.embedder = embedder;
        }
        if let Some(dimension) = env_parse::<usize>("LORE_EMBED_DIM").filter(|d| *d > 0) {
            self.dimension = dimension;
        }
        if let Some(ttl) = env_parse("LORE_INDEX_TTL_SECS") {
            self.index_ttl_secs = ttl;
        }
        if let Some(ttl) = env_parse("LORE_ANALYSIS_TTL_SECS") {
            self.analysis_ttl_secs = ttl;
        }
        if let Some(max) = env_parse("LORE_MAX_RESULTS") {
            self.max_results_per_namespace = Some(max);
        }
        if let Some(top_k) = env_parse("LORE_TOP_K") {
            self.top_k = top_k;
        }
        let min_score = env_parse::<f32>("LORE_MIN_SCORE").filter(|s| (0.0..=1.0).contains(s));
        if let Some(min_score) = min_score {
            self.min_score = min_score;
        }
        if let Some(ms) = env_parse("LORE_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = Some(ms);
        }
        if let Some(ms) = env_parse("LORE_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = ms;
        }
        self
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    pub fn embedder_signature(&self) -> EmbedderSignature {
        EmbedderSignature::new(&self.data_dir, &self.embedder, self.dimension)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }

    pub fn analysis_ttl(&self) -> Duration {
        Duration::from_secs(self.analysis_ttl_secs)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "lore-semantic", "lore-semantic")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".lore-semantic"))
}

fn env_string(name: &str) -> Option<String> {
    dotenvy::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
