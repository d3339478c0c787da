//! FastEmbed-backed ML embedder (MiniLM).
//!
//! Loads an ONNX model plus tokenizer files from a local directory; nothing is
//! downloaded. Every failure, at load time or while embedding, is reported as
//! [`EmbedderError::Unavailable`] so the service can fall back to hashing.

use std::path::{Path, PathBuf};
use std::time::Instant;

use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::embedder::{Embedder, EmbedderError, EmbedderResult, l2_normalize};
use super::embedder_registry::{EmbedderRegistry, REQUIRED_ONNX_FILES};

pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    id: String,
    dimension: usize,
}

impl FastEmbedder {
    pub fn required_model_files() -> &'static [&'static str] {
        REQUIRED_ONNX_FILES
    }

    /// Load a registered model by name from `<data_dir>/models/`.
    pub fn load_by_name(data_dir: &Path, name: &str) -> EmbedderResult<Self> {
        let registry = EmbedderRegistry::new(data_dir);
        let entry = registry.validate(name)?;
        let model_dir = entry.model_dir(data_dir).ok_or_else(|| {
            EmbedderError::Unavailable(format!("embedder '{name}' has no model files"))
        })?;
        Self::load_from_dir(&model_dir, entry.id, entry.dimension)
    }

    /// Load the model files found in `model_dir`.
    pub fn load_from_dir(model_dir: &Path, id: &str, dimension: usize) -> EmbedderResult<Self> {
        let started = Instant::now();
        let read = |name: &str| -> EmbedderResult<Vec<u8>> {
            let path: PathBuf = model_dir.join(name);
            std::fs::read(&path).map_err(|e| {
                EmbedderError::Unavailable(format!("reading {}: {e}", path.display()))
            })
        };

        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read("tokenizer.json")?,
            config_file: read("config.json")?,
            special_tokens_map_file: read("special_tokens_map.json")?,
            tokenizer_config_file: read("tokenizer_config.json")?,
        };
        let model = UserDefinedEmbeddingModel::new(read("model.onnx")?, tokenizer_files)
            .with_pooling(Pooling::Mean);

        let embedding =
            TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::default())
                .map_err(|e| {
                    EmbedderError::Unavailable(format!(
                        "loading model from {}: {e}",
                        model_dir.display()
                    ))
                })?;

        info!(
            embedder = id,
            model_dir = %model_dir.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded fastembed model"
        );

        Ok(Self {
            model: Mutex::new(embedding),
            id: id.to_string(),
            dimension,
        })
    }
}

impl Embedder for FastEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .ok_or_else(|| EmbedderError::Failed("model returned no embedding".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let mut vectors = self
            .model
            .lock()
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbedderError::Unavailable(format!("fastembed inference: {e}")))?;

        if vectors.len() != texts.len() {
            return Err(EmbedderError::Failed(format!(
                "model returned {} embeddings for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for vector in &mut vectors {
            if vector.len() != self.dimension {
                return Err(EmbedderError::Failed(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
            l2_normalize(vector);
        }

        debug!(
            embedder = %self.id,
            count = texts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fastembed batch"
        );
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_semantic(&self) -> bool {
        true
    }
}
