//! Search index assembly.
//!
//! One [`IndexEntry`] per (entity, in-scope field instance). Field text is
//! `"{field_key}: {value}"` after canonicalization; vectors come from the
//! index embedding namespace, so rebuilding against a warm cache embeds
//! nothing. The assembled [`SearchIndex`] is stored in a [`ResultCache`]
//! under the scope's canonical key and tagged with the embedder id.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::canonicalize::field_text;
use super::corpus::{CorpusProvider, EntityKind};
use super::embedder_service::EmbedderService;
use super::scope::Scope;
use crate::cache::{CacheError, EmbeddingCache, ResultCache};
use crate::error::SearchResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub entity_type: EntityKind,
    pub entity_id: String,
    /// `"{category}.{field_key}"`
    pub field_path: String,
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchIndex {
    pub embedder_id: String,
    pub scope: Scope,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<IndexEntry>,
}

impl SearchIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct SearchIndexBuilder {
    embedder: Arc<EmbedderService>,
    embeddings: Arc<EmbeddingCache>,
    indexes: Arc<ResultCache>,
}

impl SearchIndexBuilder {
    pub fn new(
        embedder: Arc<EmbedderService>,
        embeddings: Arc<EmbeddingCache>,
        indexes: Arc<ResultCache>,
    ) -> Self {
        Self {
            embedder,
            embeddings,
            indexes,
        }
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingCache> {
        &self.embeddings
    }

    pub fn indexes(&self) -> &Arc<ResultCache> {
        &self.indexes
    }

    /// Cached index for `scope` if fresh and built by the active embedder,
    /// otherwise build and cache it. Concurrent calls for one scope share a
    /// single build.
    pub fn build_or_get(
        &self,
        scope: &Scope,
        provider: &dyn CorpusProvider,
    ) -> SearchResult<Arc<SearchIndex>> {
        let key = scope.cache_key();
        let active = self.embedder.active_id();
        let payload = self.indexes.get_or_compute(
            &key,
            &active,
            index_metadata(scope),
            || -> SearchResult<Value> {
                let index = self.build(scope, provider)?;
                Ok(serde_json::to_value(&index).map_err(CacheError::from)?)
            },
        )?;

        let index = match serde_json::from_value::<SearchIndex>(payload) {
            Ok(index) => index,
            Err(err) => {
                warn!(key = %key, error = %err, "cached index payload unreadable, rebuilding");
                return self.rebuild(scope, provider).map(Arc::new);
            }
        };

        // The model can fail mid-build; the hash embedder then produced the index.
        if index.embedder_id != self.embedder.active_id() {
            debug!(
                key = %key,
                cached = %index.embedder_id,
                "cached index built by another embedder, rebuilding"
            );
            return self.rebuild(scope, provider).map(Arc::new);
        }
        Ok(Arc::new(index))
    }

    /// Build the index for `scope` and overwrite the cached one.
    pub fn rebuild(
        &self,
        scope: &Scope,
        provider: &dyn CorpusProvider,
    ) -> SearchResult<SearchIndex> {
        let index = self.build(scope, provider)?;
        let payload = serde_json::to_value(&index).map_err(CacheError::from)?;
        self.indexes.set_with_model(
            &scope.cache_key(),
            payload,
            &index.embedder_id,
            index_metadata(scope),
        )?;
        Ok(index)
    }

    /// Build the index for `scope` without touching the result cache.
    pub fn build(&self, scope: &Scope, provider: &dyn CorpusProvider) -> SearchResult<SearchIndex> {
        let start = Instant::now();
        let entities = provider.list_entities(scope)?;

        let mut slots: Vec<(EntityKind, String, String, String)> = Vec::new();
        for entity in &entities {
            for (category, key, value) in entity.fields_in(scope) {
                let text = field_text(key, value);
                if text.is_empty() {
                    continue;
                }
                slots.push((
                    entity.kind,
                    entity.id.clone(),
                    format!("{category}.{}", key.trim()),
                    text,
                ));
            }
        }

        let texts: Vec<&str> = slots.iter().map(|(_, _, _, text)| text.as_str()).collect();
        let batch = self.embeddings.get_or_compute_batch_tagged(&texts, &self.embedder)?;

        let entries: Vec<IndexEntry> = slots
            .into_iter()
            .zip(batch.vectors)
            .map(|((entity_type, entity_id, field_path, text), vector)| IndexEntry {
                entity_type,
                entity_id,
                field_path,
                text,
                vector,
            })
            .collect();

        info!(
            scope = %scope.categories().join(","),
            entities = entities.len(),
            entries = entries.len(),
            embedder = %batch.embedder_id,
            elapsed_ms = start.elapsed().as_millis(),
            "built semantic index"
        );

        Ok(SearchIndex {
            embedder_id: batch.embedder_id,
            scope: scope.clone(),
            built_at: Utc::now(),
            entries,
        })
    }
}

impl std::fmt::Debug for SearchIndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndexBuilder")
            .field("embeddings", &self.embeddings.namespace())
            .field("indexes", &self.indexes.namespace())
            .finish()
    }
}

fn index_metadata(scope: &Scope) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("scope".to_string(), json!(scope.categories()));
    metadata
}
