//! Embedder registry for backend selection.
//!
//! | Name | ID | Dimension | Type | Notes |
//! |------|-----|-----------|------|-------|
//! | minilm | minilm-384 | 384 | ML | Default semantic embedder |
//! | hash | fnv1a-{dim} | configurable | Hash | Always available fallback |
//!
//! The registry only inspects the filesystem; loading happens in
//! [`EmbedderService`](super::embedder_service::EmbedderService).

use std::path::{Path, PathBuf};

use super::embedder::{EmbedderError, EmbedderResult};
use super::hash_embedder::HashEmbedder;

/// Hash embedder name (always available).
pub const HASH_EMBEDDER: &str = "hash";

/// Pseudo-name selecting the best available embedder.
pub const AUTO_EMBEDDER: &str = "auto";

/// Files required for any ONNX-based embedder.
pub const REQUIRED_ONNX_FILES: &[&str] = &[
    "model.onnx",
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

/// Information about a registered embedder.
#[derive(Debug, Clone)]
pub struct RegisteredEmbedder {
    /// Short name for config (e.g., "minilm", "hash").
    pub name: &'static str,
    /// Embedder ID at the default dimension (e.g., "minilm-384").
    pub id: &'static str,
    /// Output dimension.
    pub dimension: usize,
    /// Whether this is a semantic (ML) embedder.
    pub is_semantic: bool,
    /// Directory under `<data_dir>/models/`, empty when no files are needed.
    pub model_dir_name: &'static str,
}

impl RegisteredEmbedder {
    fn requires_model_files(&self) -> bool {
        !self.model_dir_name.is_empty()
    }

    /// Check if this embedder is available in the given data directory.
    pub fn is_available(&self, data_dir: &Path) -> bool {
        self.missing_files(data_dir).is_empty()
    }

    /// Get the model directory path for this embedder (if applicable).
    pub fn model_dir(&self, data_dir: &Path) -> Option<PathBuf> {
        if !self.requires_model_files() {
            return None;
        }
        Some(data_dir.join("models").join(self.model_dir_name))
    }

    /// Get missing model files for this embedder.
    pub fn missing_files(&self, data_dir: &Path) -> Vec<String> {
        match self.model_dir(data_dir) {
            Some(model_dir) => REQUIRED_ONNX_FILES
                .iter()
                .filter(|f| !model_dir.join(f).is_file())
                .map(|f| (*f).to_string())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Static registry of all supported embedders.
pub static EMBEDDERS: &[RegisteredEmbedder] = &[
    RegisteredEmbedder {
        name: "minilm",
        id: "minilm-384",
        dimension: 384,
        is_semantic: true,
        model_dir_name: "all-MiniLM-L6-v2",
    },
    RegisteredEmbedder {
        name: "hash",
        id: "fnv1a-384",
        dimension: 384,
        is_semantic: false,
        model_dir_name: "",
    },
];

/// Embedder registry with data directory context.
pub struct EmbedderRegistry {
    data_dir: PathBuf,
}

impl EmbedderRegistry {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Get embedder info by name or id. Hash ids match at any dimension.
    pub fn get(&self, name: &str) -> Option<&'static RegisteredEmbedder> {
        let name_lower = name.to_ascii_lowercase();
        if HashEmbedder::owns_id(&name_lower) {
            return EMBEDDERS.iter().find(|e| e.name == HASH_EMBEDDER);
        }
        EMBEDDERS.iter().find(|e| {
            e.name == name_lower
                || e.id == name_lower
                || e.id.starts_with(&format!("{name_lower}-"))
        })
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| e.is_available(&self.data_dir))
            .unwrap_or(false)
    }

    /// Best available semantic embedder, if any model is installed.
    pub fn best_semantic(&self) -> Option<&'static RegisteredEmbedder> {
        EMBEDDERS
            .iter()
            .filter(|e| e.is_semantic)
            .find(|e| e.is_available(&self.data_dir))
    }

    /// Resolve a configured name (`auto`, `hash`, or a model name) to a
    /// registry entry. `auto` picks the best installed model and falls back
    /// to the hash embedder.
    pub fn resolve(&self, name: &str) -> EmbedderResult<&'static RegisteredEmbedder> {
        if name.eq_ignore_ascii_case(AUTO_EMBEDDER) {
            return Ok(self
                .best_semantic()
                .or_else(|| self.get(HASH_EMBEDDER))
                .unwrap_or(&EMBEDDERS[EMBEDDERS.len() - 1]));
        }
        self.get(name).ok_or_else(|| {
            EmbedderError::Unavailable(format!(
                "unknown embedder '{}'. Available: {}",
                name,
                EMBEDDERS
                    .iter()
                    .map(|e| e.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    /// Validate that an embedder is ready to use.
    pub fn validate(&self, name: &str) -> EmbedderResult<&'static RegisteredEmbedder> {
        let embedder = self.resolve(name)?;

        if !embedder.is_available(&self.data_dir) {
            let missing = embedder.missing_files(&self.data_dir);
            let model_dir = embedder
                .model_dir(&self.data_dir)
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "unknown".to_string());

            return Err(EmbedderError::Unavailable(format!(
                "embedder '{}' not available: missing files in {}: {}",
                embedder.name,
                model_dir,
                missing.join(", ")
            )));
        }

        Ok(embedder)
    }
}
