//! Named cache partitions with entry-count and age eviction.
//!
//! A [`CacheStorage`] is either purely in memory or backed by a directory in
//! which every partition is a single JSON file, `<dir>/<partition>.json`,
//! rewritten atomically (tmp + rename) after each mutation. Inside a Tokio
//! runtime the rewrite runs on the blocking pool; [`CacheStorage::flush()`]
//! waits for outstanding writes. Binary bodies are stored base64-encoded.
//! Partitions from earlier runs are discovered from the directory so that
//! activation can delete the ones belonging to other versions.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::http::InterceptedResponse;
use crate::clock::Clock;
use crate::subscription::lock;
use crate::telemetry;
use crate::{MuninnError, Result};

/// On-disk format version of a partition file.
const PARTITION_FILE_VERSION: u32 = 2;

/// Stored response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredBody {
    Json(Value),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
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
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// One cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: StoredBody,
    /// Epoch millis when the record was (last) put.
    pub inserted_at: u64,
}

impl CacheRecord {
    /// Capture a response. JSON bodies are kept as values, everything else
    /// as raw bytes. Headers that aren't valid UTF-8 are dropped.
    pub fn from_response(key: impl Into<String>, response: &InterceptedResponse) -> Self {
        let is_json = response
            .content_type()
            .is_some_and(|ct| ct.contains("json"));
        let body = match is_json.then(|| response.json_body()).flatten() {
            Some(value) => StoredBody::Json(value),
            None => StoredBody::Binary(response.body.clone()),
        };
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            key: key.into(),
            status: response.status.as_u16(),
            headers,
            body,
            inserted_at: 0,
        }
    }

    /// Replace (or add) a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Rebuild the response this record was captured from.
    pub fn to_response(&self) -> InterceptedResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }
        let body = match &self.body {
            StoredBody::Json(value) => {
                headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                value.to_string().into_bytes()
            }
            StoredBody::Binary(bytes) => bytes.clone(),
        };
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        InterceptedResponse::new(status, headers, body)
    }
}

#[derive(Deserialize)]
struct PartitionFile {
    version: u32,
    records: Vec<CacheRecord>,
}

#[derive(Serialize)]
struct PartitionFileRef<'a> {
    version: u32,
    records: Vec<&'a CacheRecord>,
}

#[derive(Default)]
struct PartitionState {
    /// Keys, oldest insertion first.
    order: VecDeque<String>,
    records: HashMap<String, CacheRecord>,
}

impl PartitionState {
    fn remove(&mut self, key: &str) -> Option<CacheRecord> {
        let record = self.records.remove(key)?;
        self.order.retain(|k| k != key);
        Some(record)
    }
}

/// Serializes disk writes of one partition and drops stale snapshots.
#[derive(Default)]
struct PartitionWriter {
    /// Generation of the snapshot last written (or deleted).
    written: Mutex<u64>,
    detached: AtomicBool,
}

impl PartitionWriter {
    fn write(&self, name: &str, path: &Path, generation: u64, json: String) {
        let mut written = lock(&self.written);
        if generation <= *written || self.detached.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = save_partition(path, &json) {
            warn!(partition = %name, error = %e, "failed to persist cache partition");
        }
        *written = generation;
    }

    /// Stop all further writes.
    fn detach(&self) {
        let _written = lock(&self.written);
        self.detached.store(true, Ordering::SeqCst);
    }
}

/// A named cache namespace.
pub struct Partition {
    name: String,
    max_entries: usize,
    max_age: Duration,
    path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    state: Mutex<PartitionState>,
    generation: AtomicU64,
    writer: Arc<PartitionWriter>,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl Partition {
    fn new(
        name: String,
        max_entries: usize,
        max_age: Duration,
        path: Option<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut state = PartitionState::default();
        if let Some(records) = path.as_deref().and_then(load_partition) {
            for record in records {
                state.order.push_back(record.key.clone());
                state.records.insert(record.key.clone(), record);
            }
        }
        Self {
            name,
            max_entries,
            max_age,
            path,
            clock,
            state: Mutex::new(state),
            generation: AtomicU64::new(0),
            writer: Arc::default(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn is_expired(&self, record: &CacheRecord, now: u64) -> bool {
        now.saturating_sub(record.inserted_at) > self.max_age.as_millis() as u64
    }

    /// Look up `key`. An expired record is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<CacheRecord> {
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        let expired = self.is_expired(state.records.get(key)?, now);
        if expired {
            state.remove(key);
            self.count_eviction("age", 1);
            self.persist(&state);
            return None;
        }
        state.records.get(key).cloned()
    }

    /// Insert or replace a record, then enforce age and count limits.
    ///
    /// A replaced key moves to the newest position.
    pub fn put(&self, mut record: CacheRecord) {
        let now = self.clock.now_millis();
        record.inserted_at = now;
        let mut state = lock(&self.state);
        state.remove(&record.key);
        state.order.push_back(record.key.clone());
        state.records.insert(record.key.clone(), record);

        let expired = self.purge_expired(&mut state, now);
        let mut evicted = 0;
        while state.records.len() > self.max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.records.remove(&oldest);
            evicted += 1;
        }
        if expired + evicted > 0 {
            debug!(partition = %self.name, expired, evicted, "evicted cache entries");
        }
        self.count_eviction("count", evicted);
        metrics::counter!(telemetry::HTTP_CACHE_STORES_TOTAL, "partition" => self.name.clone())
            .increment(1);
        self.persist(&state);
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = lock(&self.state);
        let removed = state.remove(key).is_some();
        if removed {
            self.persist(&state);
        }
        removed
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut state = lock(&self.state);
        let removed = self.purge_expired(&mut state, now);
        if removed > 0 {
            self.persist(&state);
        }
        removed
    }

    fn purge_expired(&self, state: &mut PartitionState, now: u64) -> usize {
        let expired: Vec<String> = state
            .order
            .iter()
            .filter(|key| {
                state
                    .records
                    .get(*key)
                    .is_some_and(|record| self.is_expired(record, now))
            })
            .cloned()
            .collect();
        for key in &expired {
            state.remove(key);
        }
        self.count_eviction("age", expired.len());
        expired.len()
    }

    fn count_eviction(&self, reason: &'static str, n: usize) {
        if n > 0 {
            metrics::counter!(
                telemetry::HTTP_CACHE_EVICTIONS_TOTAL,
                "partition" => self.name.clone(),
                "reason" => reason
            )
            .increment(n as u64);
        }
    }

    /// Keys in insertion order, oldest first.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.state).order.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the partition and write it out, on the blocking pool when
    /// a runtime is available. Failures are logged; the in-memory state
    /// stays authoritative for this process.
    fn persist(&self, state: &PartitionState) {
        let Some(path) = &self.path else {
            return;
        };
        let file = PartitionFileRef {
            version: PARTITION_FILE_VERSION,
            records: state
                .order
                .iter()
                .filter_map(|key| state.records.get(key))
                .collect(),
        };
        let json = match serde_json::to_string(&file) {
            Ok(json) => json,
            Err(e) => {
                warn!(partition = %self.name, error = %e, "failed to encode cache partition");
                return;
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        match Handle::try_current() {
            Ok(runtime) => {
                let writer = self.writer.clone();
                let name = self.name.clone();
                let path = path.clone();
                let task = runtime.spawn_blocking(move || {
                    writer.write(&name, &path, generation, json);
                });
                let mut pending = lock(&self.pending);
                pending.retain(|task| !task.is_finished());
                pending.push(task);
            }
            Err(_) => self.writer.write(&self.name, path, generation, json),
        }
    }

    /// Wait until every write started so far has reached the disk.
    pub async fn flush(&self) {
        let pending = std::mem::take(&mut *lock(&self.pending));
        for task in pending {
            if let Err(e) = task.await {
                warn!(partition = %self.name, error = %e, "cache partition write task failed");
            }
        }
    }
}

/// Load a partition file.
///
/// Returns `None` on missing or corrupt file (logs a warning on corrupt).
fn load_partition(path: &Path) -> Option<Vec<CacheRecord>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read cache partition");
            return None;
        }
    };
    match serde_json::from_str::<PartitionFile>(&content) {
        Ok(file) if file.version == PARTITION_FILE_VERSION => Some(file.records),
        Ok(file) => {
            warn!(path = %path.display(), version = file.version, "unsupported cache partition version");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cache partition");
            None
        }
    }
}

/// Save a partition file (atomic write via tmp + rename).
fn save_partition(path: &Path, json: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|e| {
        MuninnError::Cache(format!(
            "failed to write cache file {}: {e}",
            tmp_path.display()
        ))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        MuninnError::Cache(format!(
            "failed to rename cache file {} → {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })?;
    Ok(())
}

/// Set of named partitions.
pub struct CacheStorage {
    dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    partitions: Mutex<BTreeMap<String, Arc<Partition>>>,
}

impl CacheStorage {
    /// Storage that lives only as long as this value.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: None,
            clock,
            partitions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Storage persisted under `dir`, created if missing.
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            MuninnError::Cache(format!("failed to create cache dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir: Some(dir),
            clock,
            partitions: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Open (or return the already open) partition `name`.
    ///
    /// Limits only apply when the partition is first opened in this process.
    pub fn open_partition(&self, name: &str, max_entries: usize, max_age: Duration) -> Arc<Partition> {
        let mut partitions = lock(&self.partitions);
        if let Some(existing) = partitions.get(name) {
            return existing.clone();
        }
        let path = self
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.json")));
        let partition = Arc::new(Partition::new(
            name.to_string(),
            max_entries,
            max_age,
            path,
            self.clock.clone(),
        ));
        debug!(partition = name, entries = partition.len(), "opened cache partition");
        partitions.insert(name.to_string(), partition.clone());
        partition
    }

    /// A partition opened earlier in this process.
    pub fn partition(&self, name: &str) -> Option<Arc<Partition>> {
        lock(&self.partitions).get(name).cloned()
    }

    /// Names of every known partition: open ones plus files on disk.
    pub fn keys(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = lock(&self.partitions).keys().cloned().collect();
        if let Some(dir) = &self.dir {
            match std::fs::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.extension().is_some_and(|ext| ext == "json")
                            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                        {
                            names.insert(stem.to_string());
                        }
                    }
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to list cache dir"),
            }
        }
        names.into_iter().collect()
    }

    /// Delete a partition and its file. Returns whether anything existed.
    pub fn delete(&self, name: &str) -> bool {
        let removed = lock(&self.partitions).remove(name);
        let mut existed = removed.is_some();
        if let Some(partition) = removed {
            partition.writer.detach();
        }
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{name}.json"));
            match std::fs::remove_file(&path) {
                Ok(()) => existed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete cache partition"),
            }
        }
        existed
    }

    /// Wait for pending writes of every open partition.
    pub async fn flush(&self) {
        let partitions: Vec<Arc<Partition>> = lock(&self.partitions).values().cloned().collect();
        for partition in partitions {
            partition.flush().await;
        }
    }

    /// Sweep every open partition. Returns the number of records removed.
    pub fn sweep(&self) -> usize {
        let partitions: Vec<Arc<Partition>> = lock(&self.partitions).values().cloned().collect();
        partitions.iter().map(|p| p.sweep()).sum()
    }
}
