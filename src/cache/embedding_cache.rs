//! Content-addressed embedding cache.
//!
//! Key = hex SHA-256 of the exact text bytes. Each record remembers the id of
//! the embedder that produced it; a lookup made while a different embedder is
//! active is a miss, so vectors from two embedders never meet in one result.
//!
//! Concurrent misses for the same text are coalesced through [`InFlight`]:
//! one caller embeds, the others wait for its vector.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::inflight::{Claim, Follower, InFlight, Leader};
use super::store::{NamespaceStore, StoreKind};
use super::{CacheError, CacheStats, StatsCounters};
use crate::search::canonicalize::content_hash_hex;
use crate::search::embedder::{EmbedderError, EmbedderResult};
use crate::search::embedder_service::{EmbeddedBatch, EmbedderService};

/// A cached vector and the embedder that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub vector: Vec<f32>,
    pub embedder: String,
}

/// Embedder switches tolerated within one batch before giving up.
const MAX_BATCH_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub struct EmbeddingCache {
    store: NamespaceStore,
    entries: RwLock<HashMap<String, EmbeddingRecord>>,
    inflight: InFlight<EmbeddingRecord>,
    stats: StatsCounters,
}

impl EmbeddingCache {
    /// Open (or create) the namespace under `cache_dir`. An unreadable file
    /// is logged and replaced on the next write.
    pub fn open(
        cache_dir: &Path,
        namespace: &str,
        lock_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let store = NamespaceStore::new(cache_dir, StoreKind::Embeddings, namespace, lock_timeout)?;
        let entries = store.load_or_empty();
        Ok(Self {
            store,
            entries: RwLock::new(entries),
            inflight: InFlight::new(),
            stats: StatsCounters::default(),
        })
    }

    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Cached vector for `text`, whatever embedder produced it.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.get_record(text).map(|record| record.vector)
    }

    pub fn get_record(&self, text: &str) -> Option<EmbeddingRecord> {
        let found = self.entries.read().get(&content_hash_hex(text)).cloned();
        match found {
            Some(_) => self.stats.hit(1),
            None => self.stats.miss(1),
        }
        found
    }

    /// Store a vector for `text` and write it through to the namespace file.
    /// Nothing changes in memory if the write fails.
    pub fn set(&self, text: &str, embedder_id: &str, vector: Vec<f32>) -> Result<(), CacheError> {
        check_vector(&vector)?;
        let record = EmbeddingRecord {
            vector,
            embedder: embedder_id.to_string(),
        };
        self.store.update(&self.entries, |entries| {
            entries.insert(content_hash_hex(text), record);
        })
    }

    /// Cached vector for `text` under the active embedder, embedding on a miss.
    pub fn get_or_compute(
        &self,
        text: &str,
        embedder: &EmbedderService,
    ) -> EmbedderResult<Vec<f32>> {
        self.get_or_compute_record(text, embedder)
            .map(|record| record.vector)
    }

    /// [`get_or_compute`](Self::get_or_compute), also returning the embedder id.
    pub fn get_or_compute_record(
        &self,
        text: &str,
        embedder: &EmbedderService,
    ) -> EmbedderResult<EmbeddingRecord> {
        let key = content_hash_hex(text);
        loop {
            let active = embedder.active_id();
            if let Some(record) = self.lookup(&key, &active) {
                self.stats.hit(1);
                return Ok(record);
            }

            match self.inflight.claim(&key) {
                Claim::Follower(follower) => {
                    if let Some(record) = follower.wait() {
                        if record.embedder == embedder.active_id() {
                            self.stats.hit(1);
                            return Ok(record);
                        }
                    }
                }
                Claim::Leader(leader) => {
                    // Another leader may have finished between lookup and claim.
                    if let Some(record) = self.lookup(&key, &active) {
                        self.stats.hit(1);
                        leader.complete(record.clone());
                        return Ok(record);
                    }
                    self.stats.miss(1);
                    let (embedder_id, vector) = embedder.embed(text)?;
                    let record = EmbeddingRecord {
                        vector,
                        embedder: embedder_id,
                    };
                    self.stats.computed(1);
                    self.store_computed(vec![(key, record.clone())]);
                    leader.complete(record.clone());
                    return Ok(record);
                }
            }
        }
    }

    /// Vectors for `texts` in input order; only misses reach the embedder,
    /// in a single `embed_batch` call.
    pub fn get_or_compute_batch(
        &self,
        texts: &[&str],
        embedder: &EmbedderService,
    ) -> EmbedderResult<Vec<Vec<f32>>> {
        self.get_or_compute_batch_tagged(texts, embedder)
            .map(|batch| batch.vectors)
    }

    /// [`get_or_compute_batch`](Self::get_or_compute_batch), with the id of
    /// the one embedder every returned vector came from.
    ///
    /// If the active embedder changes while the batch is computed (the model
    /// failed and the hash embedder took over), the whole batch is re-checked
    /// under the new embedder.
    pub fn get_or_compute_batch_tagged(
        &self,
        texts: &[&str],
        embedder: &EmbedderService,
    ) -> EmbedderResult<EmbeddedBatch> {
        let keys: Vec<String> = texts.iter().map(|text| content_hash_hex(text)).collect();

        for attempt in 1..=MAX_BATCH_ATTEMPTS {
            let active = embedder.active_id();
            let mut resolved: HashMap<&str, Vec<f32>> = HashMap::new();
            let mut hits = 0u64;

            {
                let entries = self.entries.read();
                for key in &keys {
                    if let Some(record) = entries.get(key).filter(|r| r.embedder == active) {
                        hits += 1;
                        resolved
                            .entry(key.as_str())
                            .or_insert_with(|| record.vector.clone());
                    }
                }
            }

            let mut leaders: Vec<(&str, Leader<'_, EmbeddingRecord>)> = Vec::new();
            let mut leader_texts: Vec<&str> = Vec::new();
            let mut followers: Vec<(&str, Follower<EmbeddingRecord>)> = Vec::new();
            for (key, text) in keys.iter().zip(texts) {
                let key = key.as_str();
                if resolved.contains_key(key)
                    || leaders.iter().any(|(k, _)| *k == key)
                    || followers.iter().any(|(k, _)| *k == key)
                {
                    continue;
                }
                match self.inflight.claim(key) {
                    Claim::Leader(leader) => {
                        if let Some(record) = self.lookup(key, &active) {
                            hits += 1;
                            resolved.insert(key, record.vector.clone());
                            leader.complete(record);
                        } else {
                            leaders.push((key, leader));
                            leader_texts.push(text);
                        }
                    }
                    Claim::Follower(follower) => followers.push((key, follower)),
                }
            }

            // Leaders publish before waiting on anyone else, so two batches
            // following each other's keys cannot deadlock.
            let mut switched = false;
            if !leaders.is_empty() {
                self.stats.miss(leaders.len() as u64);
                let batch = embedder.embed_batch(&leader_texts)?;
                if batch.vectors.len() != leaders.len() {
                    return Err(EmbedderError::Failed(format!(
                        "embedder returned {} vectors for {} texts",
                        batch.vectors.len(),
                        leaders.len()
                    )));
                }
                self.stats.computed(leaders.len() as u64);
                switched = batch.embedder_id != active;

                let computed: Vec<(String, EmbeddingRecord)> = leaders
                    .iter()
                    .zip(batch.vectors)
                    .map(|((key, _), vector)| {
                        (
                            key.to_string(),
                            EmbeddingRecord {
                                vector,
                                embedder: batch.embedder_id.clone(),
                            },
                        )
                    })
                    .collect();
                self.store_computed(computed.clone());
                for ((key, leader), (_, record)) in leaders.into_iter().zip(computed) {
                    if !switched {
                        resolved.insert(key, record.vector.clone());
                    }
                    leader.complete(record);
                }
            }

            let mut incomplete = switched;
            for (key, follower) in followers {
                match follower.wait() {
                    Some(record) if record.embedder == active => {
                        resolved.insert(key, record.vector);
                    }
                    _ => incomplete = true,
                }
            }

            if incomplete {
                debug!(attempt, embedder = %active, "embedder changed mid-batch, re-checking");
                continue;
            }

            self.stats.hit(hits);
            let vectors = keys
                .iter()
                .map(|key| resolved.get(key.as_str()).cloned())
                .collect::<Option<Vec<_>>>();
            if let Some(vectors) = vectors {
                return Ok(EmbeddedBatch {
                    embedder_id: active,
                    vectors,
                });
            }
        }

        Err(EmbedderError::Failed(format!(
            "embedder kept changing across {MAX_BATCH_ATTEMPTS} attempts"
        )))
    }

    /// Remove every record and rewrite the namespace empty.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.update(&self.entries, |entries| entries.clear())
    }

    /// Number of records.
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn lookup(&self, key: &str, embedder_id: &str) -> Option<EmbeddingRecord> {
        self.entries
            .read()
            .get(key)
            .filter(|record| record.embedder == embedder_id)
            .cloned()
    }

    /// Write computed records through to the namespace. A failed write is
    /// logged and the records are kept in memory only.
    fn store_computed(&self, records: Vec<(String, EmbeddingRecord)>) {
        let records: Vec<(String, EmbeddingRecord)> = records
            .into_iter()
            .filter(|(key, record)| {
                let finite = check_vector(&record.vector).is_ok();
                if !finite {
                    warn!(
                        key = %key,
                        embedder = %record.embedder,
                        "not caching non-finite vector"
                    );
                }
                finite
            })
            .collect();
        if records.is_empty() {
            return;
        }
        let written = self.store.update(&self.entries, |entries| {
            entries.extend(records.iter().cloned());
        });
        if let Err(err) = written {
            warn!(
                namespace = %self.store.namespace(),
                error = %err,
                "failed to persist embedding cache; keeping values in memory"
            );
            self.entries.write().extend(records);
        }
    }
}

fn check_vector(vector: &[f32]) -> Result<(), CacheError> {
    if vector.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CacheError::InvalidValue(
            "embedding contains NaN or infinite values".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::embedder::Embedder;
    use crate::search::embedder_service::EmbedderSignature;
    use crate::search::hash_embedder::HashEmbedder;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Hash embedder that counts texts it is asked to embed.
    struct CountingEmbedder {
        inner: HashEmbedder,
        texts: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl Embedder for CountingEmbedder {
        fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
            self.texts.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }

        fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            texts.iter().map(|t| self.inner.embed(t)).collect()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn id(&self) -> &str {
            "counting-64"
        }

        fn is_semantic(&self) -> bool {
            true
        }
    }

    fn counting_service() -> (EmbedderService, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let texts = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (t, c) = (Arc::clone(&texts), Arc::clone(&calls));
        let service = EmbedderService::with_loader(
            EmbedderSignature::new("", "counting", 64),
            Arc::new(move |_sig: &EmbedderSignature| -> EmbedderResult<Arc<dyn Embedder>> {
                Ok(Arc::new(CountingEmbedder {
                    inner: HashEmbedder::new(64),
                    texts: Arc::clone(&t),
                    calls: Arc::clone(&c),
                }))
            }),
        );
        (service, texts, calls)
    }

    fn open(dir: &Path) -> EmbeddingCache {
        EmbeddingCache::open(dir, "test_ns", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_get_or_compute_embeds_once() {
        let tmp = tempdir().unwrap();
        let cache = open(tmp.path());
        let (service, texts, _) = counting_service();

        let first = cache.get_or_compute("cat", &service).unwrap();
        let second = cache.get_or_compute("cat", &service).unwrap();
        assert_eq!(first, second);
        assert_eq!(texts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.size(), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.computed, 1);
    }

    #[test]
    fn test_batch_only_embeds_misses() {
        let tmp = tempdir().unwrap();
        let cache = open(tmp.path());
        let (service, texts, calls) = counting_service();

        cache.get_or_compute("a", &service).unwrap();
        assert_eq!(texts.load(Ordering::SeqCst), 1);

        let vectors = cache
            .get_or_compute_batch(&["a", "b", "c", "b"], &service)
            .unwrap();
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors[1], vectors[3]);
        // "b" and "c" only, in one batch call.
        assert_eq!(texts.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.size(), 3);

        let direct = HashEmbedder::new(64).embed("c").unwrap();
        assert_eq!(vectors[2], direct);
    }

    #[test]
    fn test_empty_batch() {
        let tmp = tempdir().unwrap();
        let cache = open(tmp.path());
        let service = EmbedderService::hash_only(32);
        let batch = cache.get_or_compute_batch_tagged(&[], &service).unwrap();
        assert!(batch.vectors.is_empty());
        assert_eq!(batch.embedder_id, "fnv1a-32");
    }

    #[test]
    fn test_records_persist_across_instances() {
        let tmp = tempdir().unwrap();
        let service = EmbedderService::hash_only(32);
        let original = {
            let cache = open(tmp.path());
            cache.get_or_compute("persisted text", &service).unwrap()
        };

        let reopened = open(tmp.path());
        assert_eq!(reopened.size(), 1);
        let record = reopened.get_record("persisted text").unwrap();
        assert_eq!(record.embedder, "fnv1a-32");
        assert_eq!(record.vector.len(), original.len());
        for (a, b) in record.vector.iter().zip(&original) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_other_embedder_records_are_misses() {
        let tmp = tempdir().unwrap();
        let cache = open(tmp.path());
        cache.set("cat", "some-other-model", vec![1.0, 0.0]).unwrap();

        let service = EmbedderService::hash_only(32);
        let vector = cache.get_or_compute("cat", &service).unwrap();
        assert_eq!(vector.len(), 32);
        assert_eq!(cache.get_record("cat").unwrap().embedder, "fnv1a-32");
    }

    #[test]
    fn test_set_rejects_non_finite() {
        let tmp = tempdir().unwrap();
        let cache = open(tmp.path());
        let err = cache.set("x", "m", vec![f32::NAN]).unwrap_err();
        assert!(matches!(err, CacheError::InvalidValue(_)));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_clear_persists_empty() {
        let tmp = tempdir().unwrap();
        let service = EmbedderService::hash_only(16);
        let cache = open(tmp.path());
        cache.get_or_compute_batch(&["a", "b"], &service).unwrap();
        assert_eq!(cache.size(), 2);
        cache.clear().unwrap();
        assert_eq!(cache.size(), 0);
        assert_eq!(open(tmp.path()).size(), 0);
    }

    #[test]
    fn test_corrupt_file_starts_empty_and_recovers() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("embeddings").join("test_ns.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage").unwrap();

        let cache = open(tmp.path());
        assert_eq!(cache.size(), 0);
        let service = EmbedderService::hash_only(16);
        cache.get_or_compute("fresh", &service).unwrap();
        assert_eq!(open(tmp.path()).size(), 1);
    }

    #[test]
    fn test_invalid_namespace() {
        let tmp = tempdir().unwrap();
        let err =
            EmbeddingCache::open(tmp.path(), "../escape", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidNamespace(_)));
    }

    #[test]
    fn test_instances_sharing_a_namespace_keep_each_others_vectors() {
        let tmp = tempdir().unwrap();
        let service = EmbedderService::hash_only(16);
        let first = open(tmp.path());
        let second = open(tmp.path());

        first.get_or_compute("from first", &service).unwrap();
        second.get_or_compute("from second", &service).unwrap();
        assert_eq!(second.size(), 2);

        let fresh = open(tmp.path());
        assert!(fresh.get("from first").is_some());
        assert!(fresh.get("from second").is_some());

        second.clear().unwrap();
        assert_eq!(open(tmp.path()).size(), 0);
    }
}
