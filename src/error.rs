//! Errors surfaced by the semantic search API.

use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;
use crate::search::embedder::EmbedderError;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("semantic search is disabled (set LORE_SEMANTIC=1 or enabled = true)")]
    FeatureDisabled,

    #[error("unknown scope category '{category}'; known categories: {known}")]
    UnknownScope { category: String, known: String },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("query timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error(transparent)]
    Embedder(#[from] EmbedderError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("corpus error: {0}")]
    Corpus(String),

    #[error("background query task failed: {0}")]
    TaskFailed(String),
}

pub type SearchResult<T> = Result<T, SearchError>;

impl SearchError {
    pub fn not_found(kind: impl std::fmt::Display, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = SearchError::UnknownScope {
            category: "nope".into(),
            known: "accounts, traits".into(),
        };
        assert_eq!(
            err.to_string(),
            "unknown scope category 'nope'; known categories: accounts, traits"
        );
        assert_eq!(
            SearchError::not_found("character", "A").to_string(),
            "character 'A' not found"
        );
        assert_eq!(
            SearchError::Timeout(Duration::from_millis(250)).to_string(),
            "query timed out after 250ms"
        );
        let err: SearchError = EmbedderError::Failed("dimension mismatch".into()).into();
        assert_eq!(err.to_string(), "embedding failed: dimension mismatch");
    }

    #[test]
    fn test_from_cache_error() {
        let err: SearchError = CacheError::InvalidKey("empty".into()).into();
        assert!(matches!(err, SearchError::Cache(_)));
    }
}
