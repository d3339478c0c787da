//! Versioned JSON namespace files.
//!
//! One file per (kind, namespace):
//!
//! ```text
//! <cache_dir>/embeddings/<namespace>.json
//! <cache_dir>/results/<namespace>.json
//! ```
//!
//! Every file is an envelope `{schema_version, kind, namespace, entries}`.
//! Rewrites replace the whole file: serialize to a temp file in the same
//! directory, fsync, rename over the target, fsync the directory. Readers
//! therefore see either the old or the new file, never a partial one.
//!
//! Writers are serialized twice: a per-store mutex within the process and a
//! `<file>.lock` sidecar (created with `create_new`) across processes. A lock
//! file older than [`STALE_LOCK_AGE`] is treated as abandoned and removed.
//! While holding both, a writer re-reads the file and applies only its own
//! change, so instances sharing a namespace never drop each other's records.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheError;

pub const SCHEMA_VERSION: u32 = 1;

/// Lock files older than this are considered left behind by a dead writer.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Embeddings,
    Results,
}

impl StoreKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Embeddings => "embeddings",
            Self::Results => "results",
        }
    }
}

#[derive(Serialize)]
struct EnvelopeOut<'a, E> {
    schema_version: u32,
    kind: StoreKind,
    namespace: &'a str,
    entries: BTreeMap<&'a String, &'a E>,
}

#[derive(Deserialize)]
struct EnvelopeIn<E> {
    schema_version: u32,
    kind: StoreKind,
    namespace: String,
    entries: HashMap<String, E>,
}

/// Namespaces may use letters, digits, `_`, `-` and `.` (not `.`/`..` alone).
pub fn validate_namespace(namespace: &str) -> Result<(), CacheError> {
    let valid = !namespace.is_empty()
        && namespace != "."
        && namespace != ".."
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidNamespace(namespace.to_string()))
    }
}

/// Path of the file backing `(kind, namespace)` under `root`.
pub fn namespace_path(root: &Path, kind: StoreKind, namespace: &str) -> PathBuf {
    root.join(kind.dir_name()).join(format!("{namespace}.json"))
}

#[derive(Debug)]
pub struct NamespaceStore {
    kind: StoreKind,
    namespace: String,
    path: PathBuf,
    lock_timeout: Duration,
    writer: Mutex<()>,
}

impl NamespaceStore {
    pub fn new(
        root: &Path,
        kind: StoreKind,
        namespace: &str,
        lock_timeout: Duration,
    ) -> Result<Self, CacheError> {
        validate_namespace(namespace)?;
        Ok(Self {
            kind,
            namespace: namespace.to_string(),
            path: namespace_path(root, kind, namespace),
            lock_timeout,
            writer: Mutex::new(()),
        })
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Read all entries. A missing file is an empty namespace.
    pub fn load<E: DeserializeOwned>(&self) -> Result<HashMap<String, E>, CacheError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(self.corrupt(format!("read failed: {err}"))),
        };
        let envelope: EnvelopeIn<E> =
            serde_json::from_str(&raw).map_err(|err| self.corrupt(err.to_string()))?;
        if envelope.schema_version != SCHEMA_VERSION {
            return Err(self.corrupt(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                envelope.schema_version
            )));
        }
        if envelope.kind != self.kind {
            return Err(self.corrupt(format!(
                "file holds {} entries, expected {}",
                envelope.kind.dir_name(),
                self.kind.dir_name()
            )));
        }
        if envelope.namespace != self.namespace {
            return Err(self.corrupt(format!(
                "file belongs to namespace '{}'",
                envelope.namespace
            )));
        }
        Ok(envelope.entries)
    }

    /// [`Self::load`], starting empty when the file is unreadable.
    pub fn load_or_empty<E: DeserializeOwned>(&self) -> HashMap<String, E> {
        match self.load() {
            Ok(entries) => {
                debug!(
                    namespace = %self.namespace,
                    kind = self.kind.dir_name(),
                    entries = entries.len(),
                    "loaded cache namespace"
                );
                entries
            }
            Err(err) => {
                warn!(
                    namespace = %self.namespace,
                    path = %self.path.display(),
                    error = %err,
                    "discarding unreadable cache file; starting empty"
                );
                HashMap::new()
            }
        }
    }

    /// Apply `change` to the namespace as it is on disk and write it back.
    ///
    /// Runs under both writer locks: the file is re-read, `change` edits
    /// that fresh copy, and the result is written atomically. Only then is
    /// `entries` replaced with the merged map, so writes made through other
    /// instances survive and a failed write leaves memory untouched.
    pub fn update<E, R>(
        &self,
        entries: &RwLock<HashMap<String, E>>,
        change: impl FnOnce(&mut HashMap<String, E>) -> R,
    ) -> Result<R, CacheError>
    where
        E: Serialize + DeserializeOwned,
    {
        let _writer = self.writer.lock();
        let _file_lock = FileLock::acquire(&self.lock_path(), self.lock_timeout)
            .map_err(|reason| self.persist_error(reason))?;

        let mut merged: HashMap<String, E> = self.load_or_empty();
        let outcome = change(&mut merged);
        let bytes = serde_json::to_vec(&EnvelopeOut {
            schema_version: SCHEMA_VERSION,
            kind: self.kind,
            namespace: &self.namespace,
            entries: merged.iter().collect(),
        })?;
        self.write_atomic(&bytes)?;

        *entries.write() = merged;
        Ok(outcome)
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<(), CacheError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| self.persist_error("cache path has no parent directory".to_string()))?;
        fs::create_dir_all(parent)
            .map_err(|err| self.persist_error(format!("create {}: {err}", parent.display())))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| self.persist_error(format!("create temp file: {err}")))?;
        temp.write_all(bytes)
            .map_err(|err| self.persist_error(format!("write temp file: {err}")))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| self.persist_error(format!("fsync temp file: {err}")))?;
        temp.persist(&self.path)
            .map_err(|err| self.persist_error(format!("rename temp file: {}", err.error)))?;
        if let Err(err) = sync_dir(parent) {
            debug!(path = %parent.display(), error = %err, "directory fsync failed");
        }

        debug!(
            namespace = %self.namespace,
            kind = self.kind.dir_name(),
            bytes = bytes.len(),
            "persisted cache namespace"
        );
        Ok(())
    }

    fn corrupt(&self, reason: String) -> CacheError {
        CacheError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }

    fn persist_error(&self, reason: String) -> CacheError {
        CacheError::Persist {
            path: self.path.clone(),
            reason,
        }
    }
}

fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// Cross-process writer lock: a sidecar file holding the writer's pid.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("create {}: {err}", parent.display()))?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        warn!(path = %path.display(), "removing stale cache lock");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(format!(
                            "timed out after {}ms waiting for writer lock {}",
                            timeout.as_millis(),
                            path.display()
                        ));
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => return Err(format!("create lock {}: {err}", path.display())),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}
