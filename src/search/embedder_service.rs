//! Caller-owned embedder selection with transparent hash fallback.
//!
//! [`EmbedderService`] owns at most one loaded heavy (model) embedder, bound to
//! the [`EmbedderSignature`] it was built for. A load or inference failure is
//! remembered for that signature and the hash embedder serves the call
//! instead; [`EmbedderService::reconfigure`] with a different signature drops
//! both the cached instance and the remembered failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::embedder::{Embedder, EmbedderError, EmbedderResult};
use super::embedder_registry::{EmbedderRegistry, HASH_EMBEDDER};
use super::fastembed_embedder::FastEmbedder;
use super::hash_embedder::HashEmbedder;

/// Configuration identity of the embedder. A cached model instance is reused
/// only while the signature stays equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbedderSignature {
    /// Root holding `models/`.
    pub data_dir: PathBuf,
    /// `auto`, `hash`, or a registered model name.
    pub model_name: String,
    /// Dimension of the hash embedder.
    pub dimension: usize,
}

impl EmbedderSignature {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        model_name: impl Into<String>,
        dimension: usize,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            model_name: model_name.into(),
            dimension,
        }
    }

    /// Signature that always selects the hash embedder.
    pub fn hash_only(dimension: usize) -> Self {
        Self::new(PathBuf::new(), HASH_EMBEDDER, dimension)
    }

    fn wants_heavy(&self) -> bool {
        !self.model_name.eq_ignore_ascii_case(HASH_EMBEDDER)
    }
}

/// Builds the heavy embedder for a signature.
pub type HeavyLoader =
    Arc<dyn Fn(&EmbedderSignature) -> EmbedderResult<Arc<dyn Embedder>> + Send + Sync>;

/// Vectors produced by one service call, tagged with the embedder that made them.
#[derive(Debug, Clone)]
pub struct EmbeddedBatch {
    pub embedder_id: String,
    pub vectors: Vec<Vec<f32>>,
}

enum HeavyState {
    Untried,
    Loaded(Arc<dyn Embedder>),
    Failed(String),
}

struct ServiceState {
    signature: EmbedderSignature,
    hash: Arc<HashEmbedder>,
    heavy: HeavyState,
}

impl ServiceState {
    fn new(signature: EmbedderSignature) -> Self {
        let heavy = if signature.wants_heavy() {
            HeavyState::Untried
        } else {
            HeavyState::Failed("hash embedder selected".to_string())
        };
        Self {
            hash: Arc::new(HashEmbedder::new(signature.dimension)),
            signature,
            heavy,
        }
    }
}

pub struct EmbedderService {
    state: RwLock<ServiceState>,
    loader: HeavyLoader,
}

impl EmbedderService {
    /// Service that loads heavy models through the registry.
    pub fn new(signature: EmbedderSignature) -> Self {
        Self::with_loader(signature, Arc::new(load_registered))
    }

    /// Service with a custom heavy loader.
    pub fn with_loader(signature: EmbedderSignature, loader: HeavyLoader) -> Self {
        Self {
            state: RwLock::new(ServiceState::new(signature)),
            loader,
        }
    }

    /// Hash-only service.
    pub fn hash_only(dimension: usize) -> Self {
        Self::new(EmbedderSignature::hash_only(dimension))
    }

    pub fn signature(&self) -> EmbedderSignature {
        self.state.read().signature.clone()
    }

    /// Switch to a new configuration. Returns `true` if the signature changed,
    /// in which case any loaded model is dropped and reloaded on next use.
    pub fn reconfigure(&self, signature: EmbedderSignature) -> bool {
        let mut state = self.state.write();
        if state.signature == signature {
            return false;
        }
        info!(
            from = %state.signature.model_name,
            to = %signature.model_name,
            "embedder reconfigured"
        );
        *state = ServiceState::new(signature);
        true
    }

    /// The heavy embedder, loading it on first use under the current signature.
    fn heavy(&self) -> Option<Arc<dyn Embedder>> {
        {
            let state = self.state.read();
            match &state.heavy {
                HeavyState::Loaded(embedder) => return Some(Arc::clone(embedder)),
                HeavyState::Failed(_) => return None,
                HeavyState::Untried => {}
            }
        }

        // Loading under the write lock keeps it to one attempt per signature.
        let mut state = self.state.write();
        match &state.heavy {
            HeavyState::Loaded(embedder) => return Some(Arc::clone(embedder)),
            HeavyState::Failed(_) => return None,
            HeavyState::Untried => {}
        }

        match (self.loader)(&state.signature) {
            Ok(embedder) => {
                info!(embedder = embedder.id(), "heavy embedder ready");
                state.heavy = HeavyState::Loaded(Arc::clone(&embedder));
                Some(embedder)
            }
            Err(err) => {
                warn!(
                    model = %state.signature.model_name,
                    error = %err,
                    fallback = state.hash.id(),
                    "heavy embedder unavailable, using hash embedder"
                );
                state.heavy = HeavyState::Failed(err.to_string());
                None
            }
        }
    }

    fn mark_failed(&self, signature: &EmbedderSignature, reason: String) {
        let mut state = self.state.write();
        if &state.signature == signature {
            warn!(
                model = %signature.model_name,
                error = %reason,
                "heavy embedder failed while embedding, using hash embedder"
            );
            state.heavy = HeavyState::Failed(reason);
        }
    }

    /// The embedder that serves calls under the current signature.
    pub fn active(&self) -> Arc<dyn Embedder> {
        match self.heavy() {
            Some(heavy) => heavy,
            None => self.state.read().hash.clone() as Arc<dyn Embedder>,
        }
    }

    /// Id of [`active`](Self::active).
    pub fn active_id(&self) -> String {
        self.active().id().to_string()
    }

    /// Why the heavy embedder is not in use, if it is not.
    pub fn fallback_reason(&self) -> Option<String> {
        let _ = self.heavy();
        match &self.state.read().heavy {
            HeavyState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Embed texts with the heavy embedder, or the hash embedder once the
    /// heavy one fails to run or returns vectors of the wrong count or
    /// dimension. Only [`EmbedderError::InvalidInput`] reaches the caller.
    pub fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<EmbeddedBatch> {
        let signature = self.signature();
        if let Some(heavy) = self.heavy() {
            let output = heavy
                .embed_batch(texts)
                .and_then(|vectors| check_output(heavy.as_ref(), texts.len(), vectors));
            match output {
                Ok(vectors) => {
                    return Ok(EmbeddedBatch {
                        embedder_id: heavy.id().to_string(),
                        vectors,
                    });
                }
                Err(EmbedderError::InvalidInput(reason)) => {
                    return Err(EmbedderError::InvalidInput(reason));
                }
                Err(err) => self.mark_failed(&signature, err.to_string()),
            }
        }

        let hash = self.state.read().hash.clone();
        debug!(embedder = hash.id(), count = texts.len(), "hash embedding batch");
        Ok(EmbeddedBatch {
            embedder_id: hash.id().to_string(),
            vectors: hash.embed_batch(texts)?,
        })
    }

    /// Single-text form of [`embed_batch`](Self::embed_batch).
    pub fn embed(&self, text: &str) -> EmbedderResult<(String, Vec<f32>)> {
        let mut batch = self.embed_batch(&[text])?;
        let vector = batch
            .vectors
            .pop()
            .ok_or_else(|| EmbedderError::Failed("embedder returned no vector".to_string()))?;
        Ok((batch.embedder_id, vector))
    }
}

impl std::fmt::Debug for EmbedderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        let heavy = match &state.heavy {
            HeavyState::Untried => "untried".to_string(),
            HeavyState::Loaded(e) => format!("loaded({})", e.id()),
            HeavyState::Failed(reason) => format!("failed({reason})"),
        };
        f.debug_struct("EmbedderService")
            .field("signature", &state.signature)
            .field("heavy", &heavy)
            .finish()
    }
}

/// Reject output that breaks the [`Embedder`] contract.
fn check_output(
    embedder: &dyn Embedder,
    expected: usize,
    vectors: Vec<Vec<f32>>,
) -> EmbedderResult<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(EmbedderError::Failed(format!(
            "{} returned {} vectors for {expected} texts",
            embedder.id(),
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != embedder.dimension()) {
        return Err(EmbedderError::Failed(format!(
            "dimension mismatch: expected {}, got {}",
            embedder.dimension(),
            bad.len()
        )));
    }
    Ok(vectors)
}

fn load_registered(signature: &EmbedderSignature) -> EmbedderResult<Arc<dyn Embedder>> {
    let registry = EmbedderRegistry::new(&signature.data_dir);
    let entry = registry.resolve(&signature.model_name)?;
    if !entry.is_semantic {
        return Err(EmbedderError::Unavailable(format!(
            "no semantic model installed under {}",
            models_dir(&signature.data_dir).display()
        )));
    }
    let embedder = FastEmbedder::load_by_name(&signature.data_dir, entry.name)?;
    Ok(Arc::new(embedder))
}

fn models_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("models")
}
