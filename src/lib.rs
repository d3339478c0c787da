//! Semantic search over a lore corpus of characters and events.
//!
//! Entity fields are embedded (a local ONNX model when installed, a
//! deterministic hash embedder otherwise), assembled into per-scope indexes,
//! and ranked by cosine similarity against query text. Vectors and indexes
//! live in persistent caches under the configured cache directory.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lore_semantic::{InMemoryCorpus, QueryOptions, SemanticConfig, SemanticQueryEngine};
//!
//! # fn main() -> anyhow::Result<()> {
//! let corpus = InMemoryCorpus::from_json(&std::fs::read_to_string("corpus.json")?)?;
//! let engine = SemanticQueryEngine::open(SemanticConfig::load(None)?, Arc::new(corpus))?;
//! let hits = engine.query("teacher in Galilee", &QueryOptions::default().with_top_k(5))?;
//! for hit in hits {
//!     println!("{} {:.2} {}", hit.entity_id, hit.score, hit.explanation);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod search;

pub use cache::{CacheError, CacheStats, EmbeddingCache, ResultCache, ResultCacheOptions};
pub use config::SemanticConfig;
pub use error::{SearchError, SearchResult};
pub use search::corpus::{CorpusProvider, Entity, EntityKind, InMemoryCorpus};
pub use search::embedder::{Embedder, EmbedderError, similarity};
pub use search::embedder_service::{EmbedderService, EmbedderSignature};
pub use search::index_builder::{IndexEntry, SearchIndex, SearchIndexBuilder};
pub use search::scope::Scope;
pub use search::semantic::{QueryOptions, SearchHit, SemanticQueryEngine};
