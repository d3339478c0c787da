//! Single-flight coordination: at most one computation per key.
//!
//! Pending computations live in a [`moka::sync::Cache`] keyed by cache key.
//! `entry_by_ref(..).or_insert_with(..)` is atomic, so exactly one caller
//! inserts the slot and becomes the [`Leader`]; everyone else gets a
//! [`Follower`] holding the same slot and blocks on it until the leader
//! publishes. A leader dropped without [`Leader::complete`] (error or panic)
//! publishes `None`, and its followers retry on their own.

use std::sync::Arc;

use moka::sync::Cache;
use once_cell::sync::OnceCell;

type Slot<V> = Arc<OnceCell<Option<V>>>;

pub struct InFlight<V> {
    calls: Cache<String, Slot<V>>,
}

pub enum Claim<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    Leader(Leader<'a, V>),
    Follower(Follower<V>),
}

impl<V> InFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Cache::builder().build(),
        }
    }

    pub fn claim(&self, key: &str) -> Claim<'_, V> {
        let entry = self
            .calls
            .entry_by_ref(key)
            .or_insert_with(|| Arc::new(OnceCell::new()));
        if entry.is_fresh() {
            Claim::Leader(Leader {
                owner: self,
                key: key.to_string(),
                slot: entry.into_value(),
                finished: false,
            })
        } else {
            Claim::Follower(Follower {
                slot: entry.into_value(),
            })
        }
    }

    /// Number of keys currently being computed.
    pub fn pending(&self) -> usize {
        self.calls.iter().count()
    }
}

impl<V> std::fmt::Debug for InFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("pending", &self.pending())
            .finish()
    }
}

impl<V> Default for InFlight<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to compute one key.
pub struct Leader<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    owner: &'a InFlight<V>,
    key: String,
    slot: Slot<V>,
    finished: bool,
}

impl<V> Leader<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the value to waiting followers and release the key.
    pub fn complete(mut self, value: V) {
        self.finish(Some(value));
    }

    fn finish(&mut self, outcome: Option<V>) {
        if self.finished {
            return;
        }
        self.finished = true;
        let _ = self.slot.set(outcome);
        // Only this leader's slot can sit under the key until it is removed.
        self.owner.calls.invalidate(&self.key);
    }
}

impl<V> Drop for Leader<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.finish(None);
    }
}

/// Handle for waiting on another caller's computation.
pub struct Follower<V> {
    slot: Slot<V>,
}

impl<V: Clone> Follower<V> {
    /// Block until the leader finishes. `None` means the leader gave up.
    pub fn wait(self) -> Option<V> {
        self.slot.wait().clone()
    }
}
