//! In-memory `ReferenceStore` backend: a process-local map behind a reader/
//! writer lock, with a background GC sweep task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{content_id, now_secs, BackendKind, Reference, ReferenceStats, StoreOptions};
use crate::error::SubstrateError;
use crate::reference_store::ReferenceStore;

struct Entry {
    bytes: Vec<u8>,
    ref_count: i64,
    ref_type: super::ReferenceType,
    created_at: i64,
    expires_at: i64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at > 0 && now_secs() > self.expires_at
    }

    fn to_reference(&self, id: &str) -> Reference {
        Reference {
            id: id.to_string(),
            ref_type: self.ref_type,
            backend: BackendKind::Memory,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Default)]
struct Counters {
    total_refs: AtomicU64,
    total_bytes: AtomicU64,
    gc_runs: AtomicU64,
    eviction_count: AtomicU64,
}

/// In-memory [`ReferenceStore`]. Not persisted across process restarts.
pub struct InMemoryReferenceStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    gc_task: Option<JoinHandle<()>>,
}

impl InMemoryReferenceStore {
    /// Creates a store with no background GC; call [`Self::with_gc_interval`]
    /// for periodic sweeping.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            closed: Arc::new(AtomicBool::new(false)),
            gc_task: None,
        }
    }

    /// Creates a store with a background sweep every `interval` that deletes
    /// expired or zero-refcount entries.
    pub fn with_gc_interval(interval: Duration) -> Self {
        let inner: Arc<RwLock<HashMap<String, Entry>>> = Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(Counters::default());
        let closed = Arc::new(AtomicBool::new(false));

        let sweep_inner = inner.clone();
        let sweep_counters = counters.clone();
        let sweep_closed = closed.clone();
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if sweep_closed.load(Ordering::SeqCst) {
                    break;
                }
                let mut guard = sweep_inner.write().await;
                let before = guard.len();
                guard.retain(|_, e| !(e.is_expired() || e.ref_count <= 0));
                let evicted = before - guard.len();
                drop(guard);
                sweep_counters
                    .gc_runs
                    .fetch_add(1, Ordering::Relaxed);
                if evicted > 0 {
                    sweep_counters
                        .eviction_count
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                    tracing::debug!(evicted, "reference store gc sweep evicted entries");
                }
            }
        });

        Self {
            inner,
            counters,
            closed,
            gc_task: Some(gc_task),
        }
    }
}

impl Default for InMemoryReferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryReferenceStore {
    fn drop(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ReferenceStore for InMemoryReferenceStore {
    async fn store(&self, bytes: &[u8], opts: StoreOptions) -> Result<Reference, SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubstrateError::Closed);
        }
        if bytes.is_empty() {
            return Err(SubstrateError::InvalidInput("empty bytes".into()));
        }

        let id = content_id(bytes);
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard.get_mut(&id) {
            entry.ref_count += 1;
            return Ok(entry.to_reference(&id));
        }

        let created_at = now_secs();
        let expires_at = if opts.ttl_seconds > 0 {
            created_at + opts.ttl_seconds
        } else {
            0
        };
        let entry = Entry {
            bytes: bytes.to_vec(),
            ref_count: 1,
            ref_type: opts.ref_type,
            created_at,
            expires_at,
        };
        let reference = entry.to_reference(&id);
        self.counters.total_refs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        guard.insert(id, entry);
        Ok(reference)
    }

    async fn resolve(&self, id: &str) -> Result<Vec<u8>, SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubstrateError::Closed);
        }
        let guard = self.inner.read().await;
        let entry = guard
            .get(id)
            .ok_or_else(|| SubstrateError::NotFound(id.to_string()))?;
        if entry.is_expired() {
            return Err(SubstrateError::Expired(id.to_string()));
        }
        Ok(entry.bytes.clone())
    }

    async fn retain(&self, id: &str) -> Result<(), SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubstrateError::Closed);
        }
        let mut guard = self.inner.write().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| SubstrateError::NotFound(id.to_string()))?;
        entry.ref_count += 1;
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubstrateError::Closed);
        }
        let mut guard = self.inner.write().await;
        let drop_now = {
            let entry = guard
                .get_mut(id)
                .ok_or_else(|| SubstrateError::NotFound(id.to_string()))?;
            entry.ref_count -= 1;
            entry.ref_count <= 0
        };
        if drop_now {
            guard.remove(id);
            self.counters.eviction_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Reference>, SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubstrateError::Closed);
        }
        let guard = self.inner.read().await;
        Ok(guard.iter().map(|(id, e)| e.to_reference(id)).collect())
    }

    async fn stats(&self) -> Result<ReferenceStats, SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubstrateError::Closed);
        }
        let guard = self.inner.read().await;
        let active_refs = guard.len() as u64;
        let current_bytes = guard.values().map(|e| e.bytes.len() as u64).sum();
        Ok(ReferenceStats {
            total_refs: self.counters.total_refs.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_refs,
            current_bytes,
            gc_runs: self.counters.gc_runs.load(Ordering::Relaxed),
            eviction_count: self.counters.eviction_count.load(Ordering::Relaxed),
        })
    }

    async fn close(&self) -> Result<(), SubstrateError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference_store::ReferenceType;

    #[tokio::test]
    async fn store_resolve_roundtrip() {
        let store = InMemoryReferenceStore::new();
        let r = store
            .store(b"payload", StoreOptions::default())
            .await
            .unwrap();
        let bytes = store.resolve(&r.id).await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn duplicate_store_dedups_and_increments_refcount() {
        let store = InMemoryReferenceStore::new();
        let r1 = store
            .store(b"dup", StoreOptions::default())
            .await
            .unwrap();
        let r2 = store
            .store(b"dup", StoreOptions::default())
            .await
            .unwrap();
        assert_eq!(r1.id, r2.id);

        store.release(&r1.id).await.unwrap();
        // first release should not have dropped refcount to zero (was 2)
        let bytes = store.resolve(&r1.id).await.unwrap();
        assert_eq!(bytes, b"dup");
    }

    #[tokio::test]
    async fn release_to_zero_deletes_immediately() {
        let store = InMemoryReferenceStore::new();
        let r = store
            .store(b"once", StoreOptions::default())
            .await
            .unwrap();
        store.release(&r.id).await.unwrap();
        let err = store.resolve(&r.id).await.unwrap_err();
        assert!(matches!(err, SubstrateError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_bytes_rejected() {
        let store = InMemoryReferenceStore::new();
        let err = store.store(b"", StoreOptions::default()).await.unwrap_err();
        assert!(matches!(err, SubstrateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_id_operations_fail_not_found() {
        let store = InMemoryReferenceStore::new();
        assert!(matches!(
            store.retain("nope").await,
            Err(SubstrateError::NotFound(_))
        ));
        assert!(matches!(
            store.release("nope").await,
            Err(SubstrateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expired_reference_resolve_fails_even_before_gc_sweep() {
        let store = InMemoryReferenceStore::new();
        let opts = StoreOptions {
            ttl_seconds: -1, // already expired relative to "now"
            ref_type: ReferenceType::Blob,
            ..StoreOptions::default()
        };
        let r = store.store(b"ttl", opts).await.unwrap();
        let err = store.resolve(&r.id).await.unwrap_err();
        assert!(matches!(err, SubstrateError::Expired(_)));
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = InMemoryReferenceStore::new();
        store.close().await.unwrap();
        assert!(matches!(
            store.store(b"x", StoreOptions::default()).await,
            Err(SubstrateError::Closed)
        ));
    }

    #[tokio::test]
    async fn gc_sweep_evicts_expired_entries() {
        let store = InMemoryReferenceStore::with_gc_interval(Duration::from_millis(20));
        let opts = StoreOptions {
            ttl_seconds: -1,
            ..StoreOptions::default()
        };
        let r = store.store(b"sweep-me", opts).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let list = store.list().await.unwrap();
        assert!(!list.iter().any(|x| x.id == r.id));
        let stats = store.stats().await.unwrap();
        assert!(stats.gc_runs > 0);
        assert!(stats.eviction_count > 0);
    }
}
