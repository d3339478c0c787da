//! Persistent caches backing semantic search.
//!
//! - **[`embedding_cache`]**: content-addressed vectors, keyed by SHA-256 of the text.
//! - **[`result_cache`]**: TTL-bounded JSON results (assembled indexes, analyses).
//! - **[`store`]**: versioned JSON namespace files with atomic, locked rewrites.
//! - **[`inflight`]**: single-flight coordination (one computation per key).
//! - **[`clock`]**: time source for TTL checks.
//!
//! Each cache is one namespace of one kind; on disk that is
//! `<cache_dir>/<kind>/<namespace>.json`.

pub mod clock;
pub mod embedding_cache;
pub mod inflight;
pub mod result_cache;
pub mod store;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use embedding_cache::{EmbeddingCache, EmbeddingRecord};
pub use result_cache::{ResultCache, ResultCacheOptions, ResultRecord};
pub use store::StoreKind;

/// Errors from the cache layer.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("invalid cache namespace '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidNamespace(String),

    #[error("invalid cache value: {0}")]
    InvalidValue(String),

    /// The persisted file is unreadable or does not match the schema.
    #[error("cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to persist {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("failed to serialize cache payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Values produced by a compute callback (an embedder or closure).
    pub computed: u64,
    /// Records dropped by the size bound.
    pub evictions: u64,
    /// Records dropped because their TTL ran out.
    pub expired: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    computed: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn hit(&self, n: u64) {
        self.hits.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self, n: u64) {
        self.misses.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn computed(&self, n: u64) {
        self.computed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn evicted(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn expired(&self, n: u64) {
        self.expired.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Reject empty or whitespace-only keys.
pub(crate) fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}
