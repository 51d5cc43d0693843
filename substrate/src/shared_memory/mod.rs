//! Namespaced, versioned key-value store with optimistic concurrency,
//! watchers, transparent compression, and agent scoping.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, RwLock};

use crate::error::SubstrateError;

const COMPRESS_THRESHOLD_BYTES: usize = 1024;
const DEFAULT_WATCH_BUFFER: usize = 32;

/// A partition of the shared key-value space with its own visibility and
/// lifecycle rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Global,
    Workflow,
    Swarm,
    Debate,
    Session,
    Agent,
}

impl Namespace {
    fn tag(self) -> &'static str {
        match self {
            Namespace::Global => "global",
            Namespace::Workflow => "workflow",
            Namespace::Swarm => "swarm",
            Namespace::Debate => "debate",
            Namespace::Session => "session",
            Namespace::Agent => "agent",
        }
    }
}

/// A value stored under a namespaced key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
    pub compressed: bool,
    pub checksum: String,
    pub metadata: HashMap<String, String>,
    pub namespace: Namespace,
    pub created_by: String,
    pub created_at: i64,
    pub updated_by: String,
    pub updated_at: i64,
}

struct Entry {
    raw_key: String,
    stored_bytes: Vec<u8>,
    compressed: bool,
    checksum: String,
    version: u64,
    metadata: HashMap<String, String>,
    namespace: Namespace,
    created_by: String,
    created_at: i64,
    updated_by: String,
    updated_at: i64,
}

impl Entry {
    fn decompressed_value(&self) -> Vec<u8> {
        if self.compressed {
            let mut decoder = GzDecoder::new(self.stored_bytes.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .expect("stored compressed value must be valid gzip");
            out
        } else {
            self.stored_bytes.clone()
        }
    }

    fn to_stored_value(&self, user_visible_key: &str) -> StoredValue {
        StoredValue {
            key: user_visible_key.to_string(),
            value: self.decompressed_value(),
            version: self.version,
            compressed: false,
            checksum: self.checksum.clone(),
            metadata: self.metadata.clone(),
            namespace: self.namespace,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_by: self.updated_by.clone(),
            updated_at: self.updated_at,
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .expect("writing to an in-memory gzip encoder cannot fail");
    encoder
        .finish()
        .expect("finishing an in-memory gzip encoder cannot fail")
}

/// `namespace\0effective_key`, where `effective_key` is `agent:{agent_id}:{key}`
/// for [`Namespace::Agent`] and `key` otherwise.
fn storage_key(namespace: Namespace, effective_key: &str) -> String {
    format!("{}\0{}", namespace.tag(), effective_key)
}

fn effective_key(namespace: Namespace, key: &str, agent_id: Option<&str>) -> Result<String, SubstrateError> {
    if namespace == Namespace::Agent {
        let agent_id = agent_id
            .ok_or_else(|| SubstrateError::InvalidInput("agent_id required for AGENT namespace".into()))?;
        Ok(format!("agent:{}:{}", agent_id, key))
    } else {
        Ok(key.to_string())
    }
}

/// Strips the `agent:{agent_id}:` prefix back off an effective key, if present.
fn strip_agent_prefix(effective_key: &str, agent_id: &str) -> Option<String> {
    effective_key
        .strip_prefix(&format!("agent:{}:", agent_id))
        .map(|s| s.to_string())
}

/// Optimistic-concurrency write request.
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub namespace: Namespace,
    pub key: String,
    pub value: Vec<u8>,
    pub expected_version: Option<u64>,
    pub agent_id: Option<String>,
    pub actor: String,
    pub metadata: HashMap<String, String>,
    pub compress: bool,
}

impl Default for Namespace {
    fn default() -> Self {
        Namespace::Global
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PutResponse {
    pub version: u64,
    pub created: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub namespace: Namespace,
    pub key: String,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub namespace: Namespace,
    pub key: String,
    pub agent_id: Option<String>,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub deleted_version: u64,
}

#[derive(Debug, Clone)]
pub struct ListRequest {
    pub namespace: Namespace,
    pub agent_id: Option<String>,
    pub key_pattern: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub namespace: Namespace,
    pub key_pattern: String,
    pub agent_id: Option<String>,
    pub include_initial: bool,
    pub buffer_size: usize,
}

/// Per-namespace counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceStats {
    pub key_count: u64,
    pub total_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub conflict_count: u64,
    pub watcher_count: u64,
    pub last_access_at: i64,
}

#[derive(Default)]
struct Counters {
    read_count: AtomicU64,
    write_count: AtomicU64,
    conflict_count: AtomicU64,
    last_access_at: AtomicI64,
}

struct Watcher {
    id: u64,
    namespace: Namespace,
    key_pattern: String,
    agent_id: Option<String>,
    sender: mpsc::Sender<StoredValue>,
}

/// Namespaced, versioned key-value store with watchers and transparent
/// compression.
pub struct SharedMemoryStore {
    data: RwLock<HashMap<String, Entry>>,
    watchers: RwLock<Vec<Watcher>>,
    next_watcher_id: AtomicU64,
    counters: DashMap<Namespace, Counters>,
    closed: AtomicBool,
}

impl SharedMemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            watchers: RwLock::new(Vec::new()),
            next_watcher_id: AtomicU64::new(1),
            counters: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check_closed(&self) -> Result<(), SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SubstrateError::Closed)
        } else {
            Ok(())
        }
    }

    fn touch(&self, namespace: Namespace, is_write: bool, is_conflict: bool) {
        let counters = self.counters.entry(namespace).or_default();
        if is_write {
            counters.write_count.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.read_count.fetch_add(1, Ordering::Relaxed);
        }
        if is_conflict {
            counters.conflict_count.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .last_access_at
            .store(now_millis(), Ordering::Relaxed);
    }

    pub async fn put(&self, req: PutRequest) -> Result<PutResponse, SubstrateError> {
        self.check_closed()?;
        if req.key.is_empty() {
            return Err(SubstrateError::InvalidInput("empty key".into()));
        }
        let eff_key = effective_key(req.namespace, &req.key, req.agent_id.as_deref())?;
        let skey = storage_key(req.namespace, &eff_key);

        let should_compress = req.compress || req.value.len() >= COMPRESS_THRESHOLD_BYTES;
        let (stored_bytes, compressed) = if should_compress {
            let compressed_bytes = compress(&req.value);
            if compressed_bytes.len() < req.value.len() {
                (compressed_bytes, true)
            } else {
                (req.value.clone(), false)
            }
        } else {
            (req.value.clone(), false)
        };
        let checksum = checksum_hex(&stored_bytes);

        let mut guard = self.data.write().await;
        let existing_version = guard.get(&skey).map(|e| e.version);

        if let Some(expected) = req.expected_version {
            match existing_version {
                None if expected > 0 => {
                    self.touch(req.namespace, true, true);
                    return Err(SubstrateError::VersionConflict {
                        key: req.key,
                        expected,
                        actual: 0,
                    });
                }
                Some(actual) if actual != expected => {
                    self.touch(req.namespace, true, true);
                    return Err(SubstrateError::VersionConflict {
                        key: req.key,
                        expected,
                        actual,
                    });
                }
                _ => {}
            }
        }

        let now = now_millis();
        let created = existing_version.is_none();
        let new_version = existing_version.unwrap_or(0) + 1;
        let created_by = guard
            .get(&skey)
            .map(|e| e.created_by.clone())
            .unwrap_or_else(|| req.actor.clone());
        let created_at = guard.get(&skey).map(|e| e.created_at).unwrap_or(now);
        let size_bytes = req.value.len() as u64;

        guard.insert(
            skey,
            Entry {
                raw_key: eff_key.clone(),
                stored_bytes,
                compressed,
                checksum,
                version: new_version,
                metadata: req.metadata,
                namespace: req.namespace,
                created_by,
                created_at,
                updated_by: req.actor,
                updated_at: now,
            },
        );

        // Notify watchers while still holding the write lock, preserving
        // causal ordering: every reader who observes version N also observes
        // every watcher event for versions <= N before observing N+1.
        self.notify_watchers(req.namespace, &req.key, &eff_key, &guard).await;
        drop(guard);

        self.touch(req.namespace, true, false);

        Ok(PutResponse {
            version: new_version,
            created,
            size_bytes,
        })
    }

    async fn notify_watchers(
        &self,
        namespace: Namespace,
        user_visible_key: &str,
        eff_key: &str,
        guard: &HashMap<String, Entry>,
    ) {
        let skey = storage_key(namespace, eff_key);
        let Some(entry) = guard.get(&skey) else {
            return;
        };
        let value = entry.to_stored_value(user_visible_key);

        let watchers = self.watchers.read().await;
        for w in watchers.iter() {
            if w.namespace != namespace {
                continue;
            }
            if let Some(ref watcher_agent) = w.agent_id {
                let visible_key = match namespace {
                    Namespace::Agent => strip_agent_prefix(eff_key, watcher_agent),
                    _ => Some(user_visible_key.to_string()),
                };
                let Some(visible_key) = visible_key else {
                    continue;
                };
                if !crate::glob::key_pattern_match(&w.key_pattern, &visible_key) {
                    continue;
                }
            } else if !crate::glob::key_pattern_match(&w.key_pattern, user_visible_key) {
                continue;
            }

            if let Err(mpsc::error::TrySendError::Full(_)) = w.sender.try_send(value.clone()) {
                tracing::debug!(watcher_id = w.id, "shared memory watcher buffer full, dropping update");
            }
        }
    }

    pub async fn get(&self, req: GetRequest) -> Result<Option<StoredValue>, SubstrateError> {
        self.check_closed()?;
        let eff_key = effective_key(req.namespace, &req.key, req.agent_id.as_deref())?;
        let skey = storage_key(req.namespace, &eff_key);
        let guard = self.data.read().await;
        self.touch(req.namespace, false, false);
        Ok(guard.get(&skey).map(|e| e.to_stored_value(&req.key)))
    }

    pub async fn delete(&self, req: DeleteRequest) -> Result<DeleteResponse, SubstrateError> {
        self.check_closed()?;
        let eff_key = effective_key(req.namespace, &req.key, req.agent_id.as_deref())?;
        let skey = storage_key(req.namespace, &eff_key);

        let mut guard = self.data.write().await;
        let Some(entry) = guard.get(&skey) else {
            return Ok(DeleteResponse {
                deleted: false,
                deleted_version: 0,
            });
        };

        if let Some(expected) = req.expected_version {
            if entry.version != expected {
                let actual = entry.version;
                self.touch(req.namespace, true, true);
                return Err(SubstrateError::VersionConflict {
                    key: req.key,
                    expected,
                    actual,
                });
            }
        }

        let version = entry.version;
        guard.remove(&skey);
        self.touch(req.namespace, true, false);
        Ok(DeleteResponse {
            deleted: true,
            deleted_version: version,
        })
    }

    pub async fn list(&self, req: ListRequest) -> Result<Vec<StoredValue>, SubstrateError> {
        self.check_closed()?;
        let guard = self.data.read().await;
        self.touch(req.namespace, false, false);

        let mut out = Vec::new();
        for entry in guard.values() {
            if entry.namespace != req.namespace {
                continue;
            }
            let user_key = match req.namespace {
                Namespace::Agent => {
                    let Some(agent_id) = req.agent_id.as_deref() else {
                        continue;
                    };
                    match strip_agent_prefix(&entry.raw_key, agent_id) {
                        Some(k) => k,
                        None => continue,
                    }
                }
                _ => entry.raw_key.clone(),
            };
            if let Some(ref pattern) = req.key_pattern {
                if !crate::glob::key_pattern_match(pattern, &user_key) {
                    continue;
                }
            }
            out.push(entry.to_stored_value(&user_key));
        }
        Ok(out)
    }

    /// Registers a watcher; returns its id (for [`Self::unwatch`]) and a
    /// receiver that yields every successful `Put` matching the namespace,
    /// key pattern, and (for `AGENT`) requesting agent.
    pub async fn watch(
        &self,
        req: WatchRequest,
    ) -> Result<(u64, mpsc::Receiver<StoredValue>), SubstrateError> {
        self.check_closed()?;
        let buffer_size = if req.buffer_size == 0 {
            DEFAULT_WATCH_BUFFER
        } else {
            req.buffer_size
        };
        let (tx, rx) = mpsc::channel(buffer_size);

        if req.include_initial {
            let guard = self.data.read().await;
            for entry in guard.values() {
                if entry.namespace != req.namespace {
                    continue;
                }
                let user_key = match req.namespace {
                    Namespace::Agent => {
                        let Some(agent_id) = req.agent_id.as_deref() else {
                            continue;
                        };
                        match strip_agent_prefix(&entry.raw_key, agent_id) {
                            Some(k) => k,
                            None => continue,
                        }
                    }
                    _ => entry.raw_key.clone(),
                };
                if !crate::glob::key_pattern_match(&req.key_pattern, &user_key) {
                    continue;
                }
                let _ = tx.try_send(entry.to_stored_value(&user_key));
            }
        }

        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let mut watchers = self.watchers.write().await;
        watchers.push(Watcher {
            id,
            namespace: req.namespace,
            key_pattern: req.key_pattern,
            agent_id: req.agent_id,
            sender: tx,
        });
        drop(watchers);

        let counters = self.counters.entry(req.namespace).or_default();
        let _ = counters; // watcher_count is derived in get_stats from the live watcher list

        Ok((id, rx))
    }

    /// Deregisters a watcher, closing its channel.
    pub async fn unwatch(&self, watch_id: u64) -> Result<(), SubstrateError> {
        self.check_closed()?;
        let mut watchers = self.watchers.write().await;
        let before = watchers.len();
        watchers.retain(|w| w.id != watch_id);
        if watchers.len() == before {
            return Err(SubstrateError::NotFound(format!("watch {}", watch_id)));
        }
        Ok(())
    }

    pub async fn get_stats(&self, namespace: Namespace) -> Result<NamespaceStats, SubstrateError> {
        self.check_closed()?;
        let guard = self.data.read().await;
        let mut key_count = 0u64;
        let mut total_bytes = 0u64;
        for entry in guard.values() {
            if entry.namespace == namespace {
                key_count += 1;
                total_bytes += entry.decompressed_value().len() as u64;
            }
        }
        drop(guard);

        let watchers = self.watchers.read().await;
        let watcher_count = watchers.iter().filter(|w| w.namespace == namespace).count() as u64;
        drop(watchers);

        let counters = self.counters.entry(namespace).or_default();
        Ok(NamespaceStats {
            key_count,
            total_bytes,
            read_count: counters.read_count.load(Ordering::Relaxed),
            write_count: counters.write_count.load(Ordering::Relaxed),
            conflict_count: counters.conflict_count.load(Ordering::Relaxed),
            watcher_count,
            last_access_at: counters.last_access_at.load(Ordering::Relaxed),
        })
    }

    /// Deletes every key in `namespace`. Used by the executor to clear the
    /// `WORKFLOW` namespace between restarts and at termination.
    pub async fn clear_namespace(&self, namespace: Namespace) -> Result<u64, SubstrateError> {
        self.check_closed()?;
        let mut guard = self.data.write().await;
        let before = guard.len();
        guard.retain(|_, e| e.namespace != namespace);
        Ok((before - guard.len()) as u64)
    }

    /// Closes every watcher channel and rejects subsequent operations.
    pub async fn close(&self) -> Result<(), SubstrateError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut watchers = self.watchers.write().await;
        watchers.clear();
        Ok(())
    }
}

impl Default for SharedMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
