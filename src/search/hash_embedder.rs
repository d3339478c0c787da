//! FNV-1a feature hashing embedder (deterministic fallback).
//!
//! Text is split into lowercase alphanumeric tokens; every token adds one
//! count to bucket `fnv1a(token) % dimension`, and the result is L2
//! normalized. FNV-1a is seed-free, so vectors are identical across runs,
//! processes and platforms. An input without tokens yields the zero vector.
//!
//! The vectors are lexical, not semantic: two texts score high only when they
//! share words.

use super::embedder::{Embedder, EmbedderResult, l2_normalize};

/// Default output dimension (matches MiniLM so indexes stay comparable in size).
pub const DEFAULT_DIMENSION: usize = 384;

const ID_PREFIX: &str = "fnv1a-";

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    id: String,
}

impl HashEmbedder {
    /// Create a hash embedder with the given dimension (minimum 1).
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            id: format!("{ID_PREFIX}{dimension}"),
        }
    }

    pub fn default_dimension() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }

    /// Whether `id` names a hash embedder of any dimension (`fnv1a-<n>`).
    pub fn owns_id(id: &str) -> bool {
        id.strip_prefix(ID_PREFIX)
            .is_some_and(|dim| dim.parse::<usize>().is_ok_and(|dim| dim > 0))
    }

    /// Split text into lowercase alphanumeric runs.
    pub fn tokenize(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    fn bucket(&self, token: &str) -> usize {
        (fnv1a_64(token.as_bytes()) % self.dimension as u64) as usize
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::default_dimension()
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in Self::tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_semantic(&self) -> bool {
        false
    }
}

/// 64-bit FNV-1a.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
