//! Search layer facade.
//!
//! - **[`embedder`]**: Embedder trait, cosine similarity, SIMD dot product.
//! - **[`hash_embedder`]**: FNV-1a feature hashing embedder (deterministic fallback).
//! - **[`fastembed_embedder`]**: FastEmbed-backed ML embedder (MiniLM).
//! - **[`embedder_registry`]**: Known embedders and model-file availability.
//! - **[`embedder_service`]**: Caller-owned embedder selection with hash fallback.
//! - **[`canonicalize`]**: Content hashing and field text synthesis.
//! - **[`corpus`]**: Entities, the corpus provider trait, an in-memory corpus.
//! - **[`scope`]**: Validated category sets and their cache keys.
//! - **[`index_builder`]**: Assembles and caches per-scope search indexes.
//! - **[`semantic`]**: Query engine, ranking and similarity finders.

pub mod canonicalize;
pub mod corpus;
pub mod embedder;
pub mod embedder_registry;
pub mod embedder_service;
pub mod fastembed_embedder;
pub mod hash_embedder;
pub mod index_builder;
pub mod scope;
pub mod semantic;
