//! TTL-bounded cache of JSON results.
//!
//! A record is valid while `now - created_at <= max_age`; expired records
//! are never returned and are dropped when touched or by
//! [`ResultCache::prune_expired`]. Every mutation is applied to the namespace
//! file as it is on disk, then the in-memory view is refreshed from the result.
//! A mutation whose write fails returns the error and changes nothing.
//!
//! `model_name` tags each record with whatever produced it (for indexes, the
//! embedder id). [`ResultCache::get_or_compute`] treats a record tagged with a
//! different model as stale.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::inflight::{Claim, InFlight};
use super::store::{NamespaceStore, StoreKind};
use super::{CacheError, CacheStats, StatsCounters, validate_key};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub model_name: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ResultCacheOptions {
    pub max_age: Duration,
    /// Oldest records are evicted beyond this many.
    pub max_entries: Option<usize>,
    pub lock_timeout: Duration,
    /// Tag for records written through [`ResultCache::set`].
    pub model_name: String,
    pub clock: Arc<dyn Clock>,
}

impl Default for ResultCacheOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            max_entries: None,
            lock_timeout: Duration::from_secs(5),
            model_name: String::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl ResultCacheOptions {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

#[derive(Debug)]
pub struct ResultCache {
    store: NamespaceStore,
    entries: RwLock<HashMap<String, ResultRecord>>,
    inflight: InFlight<ResultRecord>,
    max_age: TimeDelta,
    max_entries: Option<usize>,
    model_name: String,
    clock: Arc<dyn Clock>,
    stats: StatsCounters,
}

impl ResultCache {
    pub fn open(
        cache_dir: &Path,
        namespace: &str,
        options: ResultCacheOptions,
    ) -> Result<Self, CacheError> {
        let store = NamespaceStore::new(
            cache_dir,
            StoreKind::Results,
            namespace,
            options.lock_timeout,
        )?;
        let entries = store.load_or_empty();
        Ok(Self {
            store,
            entries: RwLock::new(entries),
            inflight: InFlight::new(),
            max_age: TimeDelta::from_std(options.max_age).unwrap_or(TimeDelta::MAX),
            max_entries: options.max_entries,
            model_name: options.model_name,
            clock: options.clock,
            stats: StatsCounters::default(),
        })
    }

    pub fn namespace(&self) -> &str {
        self.store.namespace()
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    fn is_expired(&self, record: &ResultRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.created_at) > self.max_age
    }

    /// Payload for `key` if present and unexpired.
    pub fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        Ok(self.get_record(key)?.map(|record| record.payload))
    }

    /// Full record for `key` if present and unexpired.
    pub fn get_record(&self, key: &str) -> Result<Option<ResultRecord>, CacheError> {
        validate_key(key)?;
        match self.lookup(key, None) {
            Some(record) => {
                self.stats.hit(1);
                Ok(Some(record))
            }
            None => {
                self.stats.miss(1);
                Ok(None)
            }
        }
    }

    /// Store `value` under `key`, stamped now and tagged with the cache's
    /// default model name.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        metadata: Map<String, Value>,
    ) -> Result<(), CacheError> {
        self.set_with_model(key, value, &self.model_name, metadata)
    }

    pub fn set_with_model(
        &self,
        key: &str,
        value: Value,
        model_name: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        self.insert(key, self.record(value, model_name, metadata))
    }

    /// Remove `key`. Returns whether a record was present.
    pub fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        validate_key(key)?;
        let removed = self
            .store
            .update(&self.entries, |entries| entries.remove(key).is_some())?;
        if removed {
            debug!(namespace = %self.namespace(), key, "invalidated cached result");
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.update(&self.entries, |entries| entries.clear())
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn prune_expired(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let removed = self.store.update(&self.entries, |entries| {
            let before = entries.len();
            entries.retain(|_, record| !self.is_expired(record, now));
            before - entries.len()
        })?;
        if removed > 0 {
            self.stats.expired(removed as u64);
            debug!(namespace = %self.namespace(), removed, "pruned expired results");
        }
        Ok(removed)
    }

    /// Cached payload for `key` if it is unexpired and was produced by
    /// `model_name`; otherwise run `compute`, store its value, and return it.
    ///
    /// Concurrent callers for the same key share one `compute`. A failed
    /// write is logged and the computed value still returned.
    pub fn get_or_compute<F, E>(
        &self,
        key: &str,
        model_name: &str,
        metadata: Map<String, Value>,
        compute: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Result<Value, E>,
        E: From<CacheError>,
    {
        validate_key(key)?;
        let leader = loop {
            if let Some(record) = self.lookup(key, Some(model_name)) {
                self.stats.hit(1);
                return Ok(record.payload);
            }
            match self.inflight.claim(key) {
                Claim::Follower(follower) => {
                    if let Some(record) = follower.wait() {
                        if record.model_name == model_name {
                            self.stats.hit(1);
                            return Ok(record.payload);
                        }
                    }
                }
                Claim::Leader(leader) => {
                    // Another leader may have finished between lookup and claim.
                    if let Some(record) = self.lookup(key, Some(model_name)) {
                        self.stats.hit(1);
                        leader.complete(record.clone());
                        return Ok(record.payload);
                    }
                    break leader;
                }
            }
        };

        self.stats.miss(1);
        let value = compute()?;
        self.stats.computed(1);

        let record = self.record(value, model_name, metadata);
        if let Err(err) = self.insert(key, record.clone()) {
            warn!(
                namespace = %self.namespace(),
                key,
                error = %err,
                "failed to persist result cache; keeping value in memory"
            );
            self.entries.write().insert(key.to_string(), record.clone());
        }
        leader.complete(record.clone());
        Ok(record.payload)
    }

    /// Number of stored records, expired ones included until pruned.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn record(
        &self,
        payload: Value,
        model_name: &str,
        metadata: Map<String, Value>,
    ) -> ResultRecord {
        ResultRecord {
            payload,
            created_at: self.clock.now(),
            model_name: model_name.to_string(),
            metadata,
        }
    }

    /// Unexpired record for `key`, optionally requiring a model. An expired
    /// record is removed (and the removal persisted) on the way out.
    fn lookup(&self, key: &str, model_name: Option<&str>) -> Option<ResultRecord> {
        let now = self.clock.now();
        let record = self.entries.read().get(key).cloned()?;
        if self.is_expired(&record, now) {
            let removed = self.store.update(&self.entries, |entries| {
                match entries.get(key) {
                    // Another instance may have rewritten the key since.
                    Some(current) if self.is_expired(current, now) => {
                        entries.remove(key);
                        true
                    }
                    _ => false,
                }
            });
            match removed {
                Ok(true) => {
                    self.stats.expired(1);
                    debug!(namespace = %self.namespace(), key, "cached result expired");
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        namespace = %self.namespace(),
                        error = %err,
                        "failed to persist expiry"
                    );
                }
            }
            return None;
        }
        match model_name {
            Some(model) if record.model_name != model => {
                debug!(
                    namespace = %self.namespace(),
                    key,
                    cached = %record.model_name,
                    wanted = model,
                    "cached result from another model"
                );
                None
            }
            _ => Some(record),
        }
    }

    /// Write `record` under `key`, evicting the oldest records past
    /// `max_entries`.
    fn insert(&self, key: &str, record: ResultRecord) -> Result<(), CacheError> {
        let evicted = self.store.update(&self.entries, |entries| {
            entries.insert(key.to_string(), record);
            let Some(max) = self.max_entries else {
                return 0u64;
            };
            let mut evicted = 0u64;
            while entries.len() > max {
                let oldest = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .min_by(|(ka, a), (kb, b)| {
                        a.created_at.cmp(&b.created_at).then_with(|| ka.cmp(kb))
                    })
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(oldest) => {
                        entries.remove(&oldest);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            evicted
        })?;
        if evicted > 0 {
            self.stats.evicted(evicted);
            debug!(namespace = %self.namespace(), evicted, "evicted oldest results");
        }
        Ok(())
    }}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use serde_json::json;
    use tempfile::tempdir;

    fn options(clock: &Arc<ManualClock>) -> ResultCacheOptions {
        ResultCacheOptions::default()
            .with_max_age(Duration::from_secs(60))
            .with_clock(clock.clone() as Arc<dyn Clock>)
            .with_model_name("test-model")
    }

    #[test]
    fn test_set_get_before_expiry() {
        let tmp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResultCache::open(tmp.path(), "analysis", options(&clock)).unwrap();

        cache.set("k", json!({"answer": 42}), Map::new()).unwrap();
        clock.advance(Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap(), Some(json!({"answer": 42})));
    }

    #[test]
    fn test_expired_record_is_absent_and_removed() {
        let tmp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResultCache::open(tmp.path(), "analysis", options(&clock)).unwrap();

        cache.set("k", json!(1), Map::new()).unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.get("k").unwrap(), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expired, 1);

        let reopened = ResultCache::open(tmp.path(), "analysis", options(&clock)).unwrap();
        assert_eq!(reopened.len(), 0);
    }

    #[test]
    fn test_empty_key_rejected() {
        let tmp = tempdir().unwrap();
        let cache = ResultCache::open(tmp.path(), "ns", ResultCacheOptions::default()).unwrap();
        assert!(matches!(cache.get(""), Err(CacheError::InvalidKey(_))));
        assert!(matches!(
            cache.set("", json!(1), Map::new()),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(cache.invalidate(" "), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let tmp = tempdir().unwrap();
        let cache = ResultCache::open(tmp.path(), "ns", ResultCacheOptions::default()).unwrap();
        cache.set("a", json!("x"), Map::new()).unwrap();
        cache.set("b", json!("y"), Map::new()).unwrap();

        assert!(cache.invalidate("a").unwrap());
        assert!(!cache.invalidate("a").unwrap());
        assert_eq!(cache.get("a").unwrap(), None);
        assert_eq!(cache.len(), 1);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        let reopened = ResultCache::open(tmp.path(), "ns", ResultCacheOptions::default()).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_prune_expired() {
        let tmp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResultCache::open(tmp.path(), "ns", options(&clock)).unwrap();

        cache.set("old", json!(1), Map::new()).unwrap();
        clock.advance(Duration::from_secs(45));
        cache.set("new", json!(2), Map::new()).unwrap();
        clock.advance(Duration::from_secs(30));

        assert_eq!(cache.prune_expired().unwrap(), 1);
        assert_eq!(cache.get("new").unwrap(), Some(json!(2)));
        assert_eq!(cache.prune_expired().unwrap(), 0);
    }

    #[test]
    fn test_get_or_compute_runs_once() {
        let tmp = tempdir().unwrap();
        let cache = ResultCache::open(tmp.path(), "ns", ResultCacheOptions::default()).unwrap();
        let mut runs = 0;

        let first: Result<Value, CacheError> =
            cache.get_or_compute("k", "m1", Map::new(), || {
                runs += 1;
                Ok(json!([1, 2, 3]))
            });
        assert_eq!(first.unwrap(), json!([1, 2, 3]));

        let second: Result<Value, CacheError> =
            cache.get_or_compute("k", "m1", Map::new(), || {
                runs += 1;
                Ok(json!("recomputed"))
            });
        assert_eq!(second.unwrap(), json!([1, 2, 3]));
        assert_eq!(runs, 1);
    }

    #[test]
    fn test_get_or_compute_model_mismatch_recomputes() {
        let tmp = tempdir().unwrap();
        let cache = ResultCache::open(tmp.path(), "ns", ResultCacheOptions::default()).unwrap();

        let _: Value = cache
            .get_or_compute::<_, CacheError>("k", "model-a", Map::new(), || Ok(json!("a")))
            .unwrap();
        let value: Value = cache
            .get_or_compute::<_, CacheError>("k", "model-b", Map::new(), || Ok(json!("b")))
            .unwrap();
        assert_eq!(value, json!("b"));
        assert_eq!(cache.get_record("k").unwrap().unwrap().model_name, "model-b");
    }

    #[test]
    fn test_get_or_compute_error_is_not_cached() {
        #[derive(Debug)]
        enum TestError {
            Cache,
            Compute,
        }
        impl From<CacheError> for TestError {
            fn from(_: CacheError) -> Self {
                Self::Cache
            }
        }

        let tmp = tempdir().unwrap();
        let cache = ResultCache::open(tmp.path(), "ns", ResultCacheOptions::default()).unwrap();
        let err = cache
            .get_or_compute("k", "m", Map::new(), || Err(TestError::Compute))
            .unwrap_err();
        assert!(matches!(err, TestError::Compute));
        assert!(cache.is_empty());
        assert!(matches!(
            cache.get_or_compute::<_, TestError>("", "m", Map::new(), || Ok(json!(1))),
            Err(TestError::Cache)
        ));
    }

    #[test]
    fn test_max_entries_evicts_oldest() {
        let tmp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResultCache::open(
            tmp.path(),
            "bounded",
            options(&clock).with_max_entries(Some(2)),
        )
        .unwrap();

        cache.set("first", json!(1), Map::new()).unwrap();
        clock.advance(Duration::from_secs(1));
        cache.set("second", json!(2), Map::new()).unwrap();
        clock.advance(Duration::from_secs(1));
        cache.set("third", json!(3), Map::new()).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first").unwrap(), None);
        assert_eq!(cache.get("third").unwrap(), Some(json!(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_metadata_and_created_at_persist() {
        let tmp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let mut metadata = Map::new();
        metadata.insert("scope".to_string(), json!(["traits"]));

        let cache = ResultCache::open(tmp.path(), "ns", options(&clock)).unwrap();
        cache.set("k", json!({"v": 1}), metadata.clone()).unwrap();
        let written = cache.get_record("k").unwrap().unwrap();

        let reopened = ResultCache::open(tmp.path(), "ns", options(&clock)).unwrap();
        let loaded = reopened.get_record("k").unwrap().unwrap();
        assert_eq!(loaded.metadata, metadata);
        assert_eq!(loaded.model_name, "test-model");
        assert_eq!(loaded.created_at, written.created_at);
    }

    #[test]
    fn test_failed_write_changes_nothing() {
        let tmp = tempdir().unwrap();
        let opts = ResultCacheOptions::default().with_lock_timeout(Duration::from_millis(50));
        let cache = ResultCache::open(tmp.path(), "locked", opts).unwrap();
        cache.set("kept", json!(1), Map::new()).unwrap();

        let mut lock = cache.path().as_os_str().to_owned();
        lock.push(".lock");
        std::fs::write(&lock, "4242").unwrap();

        assert!(matches!(
            cache.set("new", json!(2), Map::new()),
            Err(CacheError::Persist { .. })
        ));
        assert!(matches!(cache.invalidate("kept"), Err(CacheError::Persist { .. })));
        assert_eq!(cache.get("new").unwrap(), None);
        assert_eq!(cache.get("kept").unwrap(), Some(json!(1)));

        std::fs::remove_file(&lock).unwrap();
        assert!(cache.invalidate("kept").unwrap());
    }

    #[test]
    fn test_instances_sharing_a_namespace_keep_each_others_writes() {
        let tmp = tempdir().unwrap();
        let first = ResultCache::open(tmp.path(), "shared", ResultCacheOptions::default()).unwrap();
        first.set("k", json!(1), Map::new()).unwrap();
        let second =
            ResultCache::open(tmp.path(), "shared", ResultCacheOptions::default()).unwrap();

        assert!(first.invalidate("k").unwrap());
        first.set("from_first", json!("a"), Map::new()).unwrap();
        second.set("from_second", json!("b"), Map::new()).unwrap();

        let fresh = ResultCache::open(tmp.path(), "shared", ResultCacheOptions::default()).unwrap();
        assert_eq!(fresh.get("k").unwrap(), None);
        assert_eq!(fresh.get("from_first").unwrap(), Some(json!("a")));
        assert_eq!(fresh.get("from_second").unwrap(), Some(json!("b")));
        // The writer's own view picks up the other instance's records.
        assert_eq!(second.get("from_first").unwrap(), Some(json!("a")));
        assert_eq!(second.get("k").unwrap(), None);
    }
}
