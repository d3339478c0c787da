//! Semantic query engine.
//!
//! ```text
//! query text ─► query embedding ─┐
//!                                ├─► cosine ─► min_score ─► top_k ─► hits
//! scope ─► index build_or_get ───┘
//! ```
//!
//! Ranking is deterministic for a fixed index: scores descend, equal scores
//! keep index order. Large indexes are scored in parallel with rayon, with
//! the same ordering.
//!
//! `find_similar_characters` / `find_similar_events` compare one entity's
//! profile (all in-scope fields) against every other entity of its kind,
//! without a persisted index, and never return the reference entity.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::canonicalize::snippet;
use super::corpus::{CorpusProvider, EntityKind};
use super::embedder::similarity;
use super::embedder_service::EmbedderService;
use super::hash_embedder::HashEmbedder;
use super::index_builder::{SearchIndex, SearchIndexBuilder};
use super::scope::Scope;
use crate::cache::{Clock, EmbeddingCache, ResultCache, ResultCacheOptions, SystemClock};
use crate::config::SemanticConfig;
use crate::error::{SearchError, SearchResult};

/// Embedding namespace for query strings.
pub const QUERY_NAMESPACE: &str = "semantic_query";
/// Embedding namespace for index field texts.
pub const INDEX_EMBEDDING_NAMESPACE: &str = "semantic_search_index";
/// Result namespace holding assembled indexes.
pub const INDEX_RESULT_NAMESPACE: &str = "semantic_indexes";
pub const CHARACTER_PROFILE_NAMESPACE: &str = "character_profiles";
pub const EVENT_PROFILE_NAMESPACE: &str = "event_profiles";

/// `matched_field` reported by the similarity finders.
pub const PROFILE_FIELD: &str = "profile";

pub const STRONG_MATCH: f32 = 0.8;
pub const MODERATE_MATCH: f32 = 0.6;

/// Minimum index size for parallel scoring.
const PARALLEL_THRESHOLD: usize = 10_000;
const PARALLEL_CHUNK_SIZE: usize = 1024;

/// Set LORE_PARALLEL_SEARCH=0 to disable parallel scoring.
static PARALLEL_SEARCH_ENABLED: Lazy<bool> = Lazy::new(|| {
    dotenvy::var("LORE_PARALLEL_SEARCH")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entity_type: EntityKind,
    pub entity_id: String,
    /// Cosine similarity clamped to `[0, 1]`.
    pub score: f32,
    pub matched_field: String,
    pub snippet: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Categories to search; `None` or empty means all.
    pub scope: Option<Vec<String>>,
    pub top_k: usize,
    pub min_score: f32,
    /// `false` rebuilds the index for the scope (vectors are still reused).
    pub use_cache: bool,
    /// Deadline for [`SemanticQueryEngine::query_async`].
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            scope: None,
            top_k: 10,
            min_score: 0.3,
            use_cache: true,
            timeout: None,
        }
    }
}

impl QueryOptions {
    pub fn from_config(config: &SemanticConfig) -> Self {
        Self {
            top_k: config.top_k,
            min_score: config.min_score,
            timeout: config.query_timeout(),
            ..Self::default()
        }
    }

    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(scope.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Score bucket label.
pub fn strength_label(score: f32) -> &'static str {
    if score >= STRONG_MATCH {
        "Strong"
    } else if score >= MODERATE_MATCH {
        "Moderate"
    } else {
        "Weak"
    }
}

/// Human-readable explanation, e.g. `Strong semantic match (0.91) on traits.trait`.
pub fn explain(score: f32, target: &str, semantic: bool) -> String {
    let basis = if semantic { "semantic" } else { "keyword" };
    format!("{} {basis} match ({score:.2}) on {target}", strength_label(score))
}

#[derive(Debug, Clone, Copy)]
struct ScoredEntry {
    score: f32,
    position: usize,
}

impl PartialEq for ScoredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredEntry {}

impl PartialOrd for ScoredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredEntry {
    /// Higher score ranks higher; on equal scores the earlier position does.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.position.cmp(&self.position))
    }
}

fn push_bounded(heap: &mut BinaryHeap<Reverse<ScoredEntry>>, entry: ScoredEntry, k: usize) {
    heap.push(Reverse(entry));
    if heap.len() > k {
        heap.pop();
    }
}

/// Rank `candidates` against `query`: keep scores `>= min_score`, best
/// `top_k`, as `(position, score)` with scores clamped to `[0, 1]`.
pub fn rank(
    query: &[f32],
    candidates: &[&[f32]],
    top_k: usize,
    min_score: f32,
) -> Vec<(usize, f32)> {
    if top_k == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let score_at = |position: usize| similarity(query, candidates[position]).clamp(0.0, 1.0);

    let parallel = *PARALLEL_SEARCH_ENABLED && candidates.len() >= PARALLEL_THRESHOLD;
    let survivors: Vec<ScoredEntry> = if parallel {
        let partial: Vec<Vec<ScoredEntry>> = (0..candidates.len())
            .collect::<Vec<_>>()
            .par_chunks(PARALLEL_CHUNK_SIZE)
            .map(|chunk| {
                let mut local = BinaryHeap::with_capacity(top_k + 1);
                for &position in chunk {
                    let score = score_at(position);
                    if score >= min_score {
                        push_bounded(&mut local, ScoredEntry { score, position }, top_k);
                    }
                }
                local.into_iter().map(|r| r.0).collect()
            })
            .collect();
        let mut merged = BinaryHeap::with_capacity(top_k + 1);
        for entry in partial.into_iter().flatten() {
            push_bounded(&mut merged, entry, top_k);
        }
        merged.into_iter().map(|r| r.0).collect()
    } else {
        let mut heap = BinaryHeap::with_capacity(top_k + 1);
        for position in 0..candidates.len() {
            let score = score_at(position);
            if score >= min_score {
                push_bounded(&mut heap, ScoredEntry { score, position }, top_k);
            }
        }
        heap.into_iter().map(|r| r.0).collect()
    };

    let mut ranked = survivors;
    ranked.sort_by(|a, b| b.cmp(a));
    ranked.into_iter().map(|e| (e.position, e.score)).collect()
}

pub struct SemanticQueryEngine {
    config: SemanticConfig,
    embedder: Arc<EmbedderService>,
    provider: Arc<dyn CorpusProvider>,
    queries: Arc<EmbeddingCache>,
    character_profiles: Arc<EmbeddingCache>,
    event_profiles: Arc<EmbeddingCache>,
    builder: SearchIndexBuilder,
    clock: Arc<dyn Clock>,
}

impl SemanticQueryEngine {
    /// Engine with an embedder service built from `config`.
    pub fn open(config: SemanticConfig, provider: Arc<dyn CorpusProvider>) -> SearchResult<Self> {
        let embedder = Arc::new(EmbedderService::new(config.embedder_signature()));
        Self::with_embedder(config, embedder, provider)
    }

    /// Engine sharing a caller-owned embedder service.
    pub fn with_embedder(
        config: SemanticConfig,
        embedder: Arc<EmbedderService>,
        provider: Arc<dyn CorpusProvider>,
    ) -> SearchResult<Self> {
        Self::with_clock(config, embedder, provider, Arc::new(SystemClock))
    }

    /// Engine whose index and analysis TTLs run on `clock`.
    pub fn with_clock(
        config: SemanticConfig,
        embedder: Arc<EmbedderService>,
        provider: Arc<dyn CorpusProvider>,
        clock: Arc<dyn Clock>,
    ) -> SearchResult<Self> {
        let cache_dir = config.cache_dir();
        let lock_timeout = config.lock_timeout();
        let open_embeddings = |namespace: &str| -> SearchResult<Arc<EmbeddingCache>> {
            Ok(Arc::new(EmbeddingCache::open(&cache_dir, namespace, lock_timeout)?))
        };

        let indexes = Arc::new(ResultCache::open(
            &cache_dir,
            INDEX_RESULT_NAMESPACE,
            ResultCacheOptions::default()
                .with_max_age(config.index_ttl())
                .with_max_entries(config.max_results_per_namespace)
                .with_lock_timeout(lock_timeout)
                .with_clock(Arc::clone(&clock)),
        )?);
        let builder = SearchIndexBuilder::new(
            Arc::clone(&embedder),
            open_embeddings(INDEX_EMBEDDING_NAMESPACE)?,
            indexes,
        );

        info!(
            cache_dir = %cache_dir.display(),
            enabled = config.enabled,
            embedder = %config.embedder,
            "semantic query engine ready"
        );

        Ok(Self {
            queries: open_embeddings(QUERY_NAMESPACE)?,
            character_profiles: open_embeddings(CHARACTER_PROFILE_NAMESPACE)?,
            event_profiles: open_embeddings(EVENT_PROFILE_NAMESPACE)?,
            builder,
            embedder,
            provider,
            config,
            clock,
        })
    }

    pub fn config(&self) -> &SemanticConfig {
        &self.config
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.config.cache_dir()
    }

    pub fn embedder(&self) -> &Arc<EmbedderService> {
        &self.embedder
    }

    /// Persistent cache for derived analyses in `namespace`. Records expire
    /// after `analysis_ttl_secs` and obey the per-namespace entry cap.
    pub fn analysis_cache(&self, namespace: &str) -> SearchResult<ResultCache> {
        if namespace == INDEX_RESULT_NAMESPACE {
            return Err(SearchError::InvalidKey(format!(
                "namespace '{namespace}' is reserved for search indexes"
            )));
        }
        let options = ResultCacheOptions::default()
            .with_max_age(self.config.analysis_ttl())
            .with_max_entries(self.config.max_results_per_namespace)
            .with_lock_timeout(self.config.lock_timeout())
            .with_clock(Arc::clone(&self.clock));
        Ok(ResultCache::open(&self.config.cache_dir(), namespace, options)?)
    }

    pub fn index_builder(&self) -> &SearchIndexBuilder {
        &self.builder
    }

    pub fn query_cache(&self) -> &Arc<EmbeddingCache> {
        &self.queries
    }

    /// Options seeded from the engine's configuration.
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions::from_config(&self.config)
    }

    fn ensure_enabled(&self) -> SearchResult<()> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(SearchError::FeatureDisabled)
        }
    }

    fn resolve_scope(&self, requested: Option<&[String]>) -> SearchResult<Scope> {
        Scope::resolve(requested, &self.provider.categories())
    }

    /// Index for `scope`, honouring `use_cache`.
    pub fn index_for(&self, scope: &Scope, use_cache: bool) -> SearchResult<Arc<SearchIndex>> {
        if use_cache {
            self.builder.build_or_get(scope, self.provider.as_ref())
        } else {
            self.builder.rebuild(scope, self.provider.as_ref()).map(Arc::new)
        }
    }

    /// Rank index entries against `text`.
    pub fn query(&self, text: &str, options: &QueryOptions) -> SearchResult<Vec<SearchHit>> {
        self.ensure_enabled()?;
        let scope = self.resolve_scope(options.scope.as_deref())?;
        if text.trim().is_empty() || options.top_k == 0 {
            debug!(top_k = options.top_k, "empty query, no hits");
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let mut query = self.queries.get_or_compute_record(text, &self.embedder)?;
        let mut index = self.index_for(&scope, options.use_cache)?;
        if query.embedder != index.embedder_id {
            // The active embedder changed between the two lookups.
            index = self.index_for(&scope, false)?;
            query = self.queries.get_or_compute_record(text, &self.embedder)?;
            if query.embedder != index.embedder_id {
                warn!(
                    query_embedder = %query.embedder,
                    index_embedder = %index.embedder_id,
                    "query and index embedders differ"
                );
            }
        }

        let candidates: Vec<&[f32]> = index.entries.iter().map(|e| e.vector.as_slice()).collect();
        let ranked = rank(&query.vector, &candidates, options.top_k, options.min_score);
        let semantic = !HashEmbedder::owns_id(&index.embedder_id);
        let hits: Vec<SearchHit> = ranked
            .into_iter()
            .map(|(position, score)| {
                let entry = &index.entries[position];
                SearchHit {
                    entity_type: entry.entity_type,
                    entity_id: entry.entity_id.clone(),
                    score,
                    matched_field: entry.field_path.clone(),
                    snippet: snippet(&entry.text),
                    explanation: explain(score, &entry.field_path, semantic),
                }
            })
            .collect();

        debug!(
            query_len = text.len(),
            scope = %scope.categories().join(","),
            candidates = index.len(),
            result_count = hits.len(),
            latency_ms = start.elapsed().as_millis(),
            "semantic query completed"
        );
        Ok(hits)
    }

    /// [`query`](Self::query) on the blocking pool, bounded by
    /// `options.timeout` (or the configured default).
    ///
    /// On timeout the caller gets [`SearchError::Timeout`]; the blocking work
    /// runs to completion in the background and its caches stay warm.
    pub async fn query_async(
        self: Arc<Self>,
        text: String,
        options: QueryOptions,
    ) -> SearchResult<Vec<SearchHit>> {
        let limit = options.timeout.or_else(|| self.config.query_timeout());
        let task = tokio::task::spawn_blocking(move || self.query(&text, &options));

        let joined = match limit {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .map_err(|_| SearchError::Timeout(limit))?,
            None => task.await,
        };
        joined.map_err(|err| SearchError::TaskFailed(err.to_string()))?
    }

    /// Characters most similar to character `id`.
    pub fn find_similar_characters(
        &self,
        id: &str,
        options: &QueryOptions,
    ) -> SearchResult<Vec<SearchHit>> {
        self.find_similar(EntityKind::Character, id, options)
    }

    /// Events most similar to event `id`.
    pub fn find_similar_events(
        &self,
        id: &str,
        options: &QueryOptions,
    ) -> SearchResult<Vec<SearchHit>> {
        self.find_similar(EntityKind::Event, id, options)
    }

    fn find_similar(
        &self,
        kind: EntityKind,
        id: &str,
        options: &QueryOptions,
    ) -> SearchResult<Vec<SearchHit>> {
        self.ensure_enabled()?;
        let scope = self.resolve_scope(options.scope.as_deref())?;
        let reference = self.provider.get_entity(kind, id)?;
        let reference_text = reference.profile_text(&scope);
        if reference_text.is_empty() || options.top_k == 0 {
            return Ok(Vec::new());
        }

        let candidates: Vec<(String, String)> = self
            .provider
            .list_entities(&scope)?
            .into_iter()
            .filter(|entity| entity.kind == kind && entity.id != reference.id)
            .map(|entity| {
                let text = entity.profile_text(&scope);
                (entity.id, text)
            })
            .filter(|(_, text)| !text.is_empty())
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let cache = match kind {
            EntityKind::Character => &self.character_profiles,
            EntityKind::Event => &self.event_profiles,
        };
        let texts: Vec<&str> = std::iter::once(reference_text.as_str())
            .chain(candidates.iter().map(|(_, text)| text.as_str()))
            .collect();
        let batch = cache.get_or_compute_batch_tagged(&texts, &self.embedder)?;
        let Some((reference_vector, candidate_vectors)) = batch.vectors.split_first() else {
            return Ok(Vec::new());
        };

        let candidate_slices: Vec<&[f32]> = candidate_vectors.iter().map(Vec::as_slice).collect();
        let ranked = rank(reference_vector, &candidate_slices, options.top_k, options.min_score);
        let semantic = !HashEmbedder::owns_id(&batch.embedder_id);
        let target = format!("{kind} '{}' {PROFILE_FIELD}", reference.id);
        Ok(ranked
            .into_iter()
            .map(|(position, score)| {
                let (candidate_id, text) = &candidates[position];
                SearchHit {
                    entity_type: kind,
                    entity_id: candidate_id.clone(),
                    score,
                    matched_field: PROFILE_FIELD.to_string(),
                    snippet: snippet(text),
                    explanation: explain(score, &target, semantic),
                }
            })
            .collect())
    }

    /// Drop every cached index (e.g. after the corpus changed).
    pub fn invalidate_indexes(&self) -> SearchResult<()> {
        self.builder.indexes().clear()?;
        Ok(())
    }
}

impl std::fmt::Debug for SemanticQueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticQueryEngine")
            .field("config", &self.config)
            .field("embedder", &self.embedder)
            .finish()
    }
}

/// Engine over an in-memory corpus loaded from a JSON document.
pub fn open_with_corpus_file(
    config: SemanticConfig,
    corpus: &Path,
) -> SearchResult<SemanticQueryEngine> {
    let provider = super::corpus::InMemoryCorpus::from_json_file(corpus)?;
    SemanticQueryEngine::open(config, Arc::new(provider))
}
