//! Embedder trait and the vector math shared by every embedding backend.
//!
//! Two backends implement [`Embedder`]:
//!
//! - [`HashEmbedder`](super::hash_embedder::HashEmbedder): FNV-1a feature hashing,
//!   deterministic and always available.
//! - [`FastEmbedder`](super::fastembed_embedder::FastEmbedder): ONNX model loaded
//!   through fastembed; may be [`EmbedderError::Unavailable`].
//!
//! Backend selection and fallback live in
//! [`EmbedderService`](super::embedder_service::EmbedderService).

use thiserror::Error;

/// Errors produced by embedding backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbedderError {
    /// The backend could not be initialized or failed while running.
    /// Callers fall back to the hash embedder on this variant.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),

    /// The input cannot be embedded by this backend.
    #[error("invalid embedder input: {0}")]
    InvalidInput(String),

    /// The backend produced output that violates its contract.
    #[error("embedding failed: {0}")]
    Failed(String),
}

pub type EmbedderResult<T> = Result<T, EmbedderError>;

/// Turns text into fixed-length vectors.
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>>;

    /// Embed several texts. Output order matches input order.
    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Stable identifier, e.g. `fnv1a-384` or `minilm-384`.
    fn id(&self) -> &str;

    /// Whether vectors carry semantic (model-based) meaning.
    fn is_semantic(&self) -> bool;
}

/// Cosine similarity of two vectors.
///
/// Returns `0.0` when either vector has zero norm or the lengths differ.
/// The result is clamped to `[-1, 1]` to absorb rounding error.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a_sq = dot_product(a, a);
    let norm_b_sq = dot_product(b, b);
    if norm_a_sq <= 0.0 || norm_b_sq <= 0.0 {
        return 0.0;
    }

    let denom = (norm_a_sq * norm_b_sq).sqrt();
    if !denom.is_finite() || denom == 0.0 {
        return 0.0;
    }

    let score = dot_product(a, b) / denom;
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = dot_product(vector, vector).sqrt();
    if norm > 0.0 && norm.is_finite() {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cached SIMD enable flag (checked once at first use).
/// Set LORE_SIMD_DOT=0 to disable.
static SIMD_DOT_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("LORE_SIMD_DOT")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

#[inline]
pub(crate) fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if *SIMD_DOT_ENABLED {
        dot_product_simd(a, b)
    } else {
        dot_product_scalar(a, b)
    }
}

#[inline]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Processes 8 floats per iteration (AVX2/SSE on x86_64, NEON on ARM).
/// Reordering the additions causes ~1e-7 relative error vs scalar, which
/// never changes ranking order.
#[inline]
fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    use wide::f32x8;

    let chunks_a = a.chunks_exact(8);
    let chunks_b = b.chunks_exact(8);
    let remainder_a = chunks_a.remainder();
    let remainder_b = chunks_b.remainder();

    let mut sum = f32x8::ZERO;
    for (ca, cb) in chunks_a.zip(chunks_b) {
        let mut arr_a = [0.0f32; 8];
        let mut arr_b = [0.0f32; 8];
        arr_a.copy_from_slice(ca);
        arr_b.copy_from_slice(cb);
        sum += f32x8::from(arr_a) * f32x8::from(arr_b);
    }

    let mut scalar_sum: f32 = sum.reduce_add();
    for (a, b) in remainder_a.iter().zip(remainder_b) {
        scalar_sum += a * b;
    }
    scalar_sum
}

/// Bench-only wrapper for scalar dot product.
#[doc(hidden)]
pub fn dot_product_scalar_bench(a: &[f32], b: &[f32]) -> f32 {
    dot_product_scalar(a, b)
}

/// Bench-only wrapper for SIMD dot product.
#[doc(hidden)]
pub fn dot_product_simd_bench(a: &[f32], b: &[f32]) -> f32 {
    dot_product_simd(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_similarity_identical_vectors() {
        let v = vec![0.3, -1.2, 4.0, 0.0, 2.5, 1.0, 1.0, 7.0, 0.5];
        assert_eq!(similarity(&v, &v), 1.0);
    }

    #[test]
    fn test_similarity_zero_vector_is_zero() {
        let v = vec![1.0, 2.0, 3.0];
        let zero = vec![0.0; 3];
        assert_eq!(similarity(&v, &zero), 0.0);
        assert_eq!(similarity(&zero, &v), 0.0);
        assert_eq!(similarity(&zero, &zero), 0.0);
    }

    #[test]
    fn test_similarity_orthogonal_and_opposite() {
        assert_eq!(similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_length_mismatch() {
        assert_eq!(similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0; 4];
        l2_normalize(&mut zero);
        assert!(zero.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_simd_matches_scalar() {
        let a: Vec<f32> = (0..37).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..37).map(|i| (i as f32 * 0.11).cos()).collect();
        let scalar = dot_product_scalar(&a, &b);
        let simd = dot_product_simd(&a, &b);
        assert!((scalar - simd).abs() < 1e-4);
    }

    proptest! {
        #[test]
        fn prop_self_similarity_is_one(v in prop::collection::vec(-100.0f32..100.0, 1..64)) {
            prop_assume!(v.iter().any(|x| x.abs() > 1e-3));
            let s = similarity(&v, &v);
            prop_assert!((s - 1.0).abs() < 1e-5, "similarity was {}", s);
        }

        #[test]
        fn prop_similarity_is_bounded_and_symmetric(
            a in prop::collection::vec(-10.0f32..10.0, 16),
            b in prop::collection::vec(-10.0f32..10.0, 16),
        ) {
            let ab = similarity(&a, &b);
            let ba = similarity(&b, &a);
            prop_assert!((-1.0..=1.0).contains(&ab));
            prop_assert!((ab - ba).abs() < 1e-5);
        }
    }
}
