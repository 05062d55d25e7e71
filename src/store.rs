//! Persisted schedule storage.
//!
//! The schedule is written as one ordered array under the `scheduleMemory`
//! key of a grouped key-value store. Each element is a [`PersistedEntry`]:
//!
//! ```json
//! { "hash": 1234, "name": "loop_update_task", "taskID": 7, "data": "<base64>" }
//! ```
//!
//! [`JsonFileStore`] keeps every group of an application in a single JSON
//! document (`settings.json`), so several schedulers can share one file under
//! different namespaces.

use crate::error::{Result, SchedulerError};
use crate::task::TaskType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Settings group used when the consumer configures nothing.
pub const DEFAULT_NAMESPACE: &str = "AutoUpdater/UpdateScheduler";

/// Key the persisted schedule array is stored under.
pub const SCHEDULE_KEY: &str = "scheduleMemory";

/// Durable key-value storage the schedule is persisted to.
pub trait KeyValueStore: Send {
    /// Read the value stored under `key`.
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`. Not durable until [`sync`](Self::sync).
    fn set(&mut self, key: &str, value: Value);

    /// Remove `key`. Not durable until [`sync`](Self::sync).
    fn remove(&mut self, key: &str);

    /// Flush pending writes to durable media and reload external changes.
    fn sync(&mut self) -> Result<()>;
}

/// One persisted schedule entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// [`TaskType::hash`] of the task.
    pub hash: u64,
    /// [`TaskType::name`] of the task.
    pub name: String,
    /// Group ID the task was scheduled under.
    #[serde(rename = "taskID")]
    pub task_id: i32,
    /// Task payload produced by `UpdateTask::store`.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl PersistedEntry {
    /// Identity of the persisted task's type.
    pub fn task_type(&self) -> TaskType {
        TaskType::from_parts(self.hash, self.name.clone())
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Schedule array on top of a key-value store
// ---------------------------------------------------------------------------

/// Reads and rewrites the persisted schedule array.
pub struct PersistentTaskStore {
    backend: Box<dyn KeyValueStore>,
}

impl PersistentTaskStore {
    /// Wrap an arbitrary key-value store.
    pub fn new(backend: Box<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// File-backed store bound to `namespace` inside the document at `path`.
    pub fn with_namespace(path: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self::new(Box::new(JsonFileStore::new(path, namespace)))
    }

    /// Flush and reload the underlying store.
    pub fn sync(&mut self) -> Result<()> {
        self.backend.sync()
    }

    /// Read the persisted schedule in storage order.
    ///
    /// Elements that cannot be decoded are skipped.
    pub fn load_entries(&self) -> Vec<PersistedEntry> {
        let Some(value) = self.backend.get(SCHEDULE_KEY) else {
            return Vec::new();
        };
        let Value::Array(items) = value else {
            warn!("persisted schedule is not an array; ignoring it");
            return Vec::new();
        };

        items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(index, "skipping undecodable schedule entry: {e}");
                    None
                }
            })
            .collect()
    }

    /// Replace the persisted schedule with `entries` and flush it.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be encoded or the store cannot be
    /// flushed.
    pub fn replace_entries(&mut self, entries: &[PersistedEntry]) -> Result<()> {
        let array = serde_json::to_value(entries)
            .map_err(|e| SchedulerError::Storage(format!("cannot encode schedule: {e}")))?;
        self.backend.remove(SCHEDULE_KEY);
        self.backend.set(SCHEDULE_KEY, array);
        self.backend.sync()?;
        debug!(count = entries.len(), "persisted schedule rewritten");
        Ok(())
    }
}

impl std::fmt::Debug for PersistentTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTaskStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// JSON document store
// ---------------------------------------------------------------------------

/// Grouped key-value store persisted as a single JSON object.
///
/// Keys are stored as `"<group>/<key>"`. Writes are buffered until
/// [`sync`](KeyValueStore::sync), which merges them into the current file
/// contents so other groups in the same document are preserved.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    group: String,
    cache: Map<String, Value>,
    pending: BTreeMap<String, Option<Value>>,
}

impl JsonFileStore {
    /// Bind to `group` inside the document at `path`. Nothing is read until
    /// the first [`sync`](KeyValueStore::sync).
    pub fn new(path: impl Into<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            group: group.into().trim_matches('/').to_owned(),
            cache: Map::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Group this store is bound to.
    pub fn group(&self) -> &str {
        &self.group
    }

    fn full_key(&self, key: &str) -> String {
        if self.group.is_empty() {
            key.to_owned()
        } else {
            format!("{}/{key}", self.group)
        }
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(SchedulerError::Storage(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            SchedulerError::Storage(format!("cannot parse {}: {e}", self.path.display()))
        })
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::Storage(format!(
                    "cannot create settings directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let json = serde_json::to_vec_pretty(document)
            .map_err(|e| SchedulerError::Storage(format!("cannot serialize settings: {e}")))?;

        // temp file -> fsync -> rename
        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(|e| {
            SchedulerError::Storage(format!("cannot create temp file {}: {e}", tmp.display()))
        })?;
        file.write_all(&json)
            .map_err(|e| SchedulerError::Storage(format!("cannot write {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| SchedulerError::Storage(format!("cannot sync {}: {e}", tmp.display())))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|e| {
            SchedulerError::Storage(format!(
                "cannot rename {} to {}: {e}",
                tmp.display(),
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(&self.full_key(key)).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        let full = self.full_key(key);
        self.cache.insert(full.clone(), value.clone());
        self.pending.insert(full, Some(value));
    }

    fn remove(&mut self, key: &str) {
        let full = self.full_key(key);
        self.cache.remove(&full);
        self.pending.insert(full, None);
    }

    fn sync(&mut self) -> Result<()> {
        let mut document = self.read_document()?;
        if !self.pending.is_empty() {
            for (key, value) in &self.pending {
                match value {
                    Some(value) => {
                        document.insert(key.clone(), value.clone());
                    }
                    None => {
                        document.remove(key);
                    }
                }
            }
            // Pending writes survive a failed flush and are retried next sync.
            self.write_document(&document)?;
            self.pending.clear();
        }
        self.cache = document;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-process store. Clones share the same contents, so a handle kept by the
/// caller observes everything the scheduler writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Value>>>,
    syncs: Arc<AtomicUsize>,
    fail_sync: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed [`sync`](KeyValueStore::sync) calls.
    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Make every following `sync` fail (simulates unavailable media).
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// Decode the persisted schedule currently held by this store.
    pub fn schedule(&self) -> Vec<PersistedEntry> {
        PersistentTaskStore::new(Box::new(self.clone())).load_entries()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn sync(&mut self) -> Result<()> {
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(SchedulerError::Storage("memory store unavailable".to_owned()));
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
