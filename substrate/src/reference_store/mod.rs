//! Content-addressed blob storage with refcount GC and TTL.
//!
//! `id` is the hex SHA-256 of the payload bytes; identical payloads
//! deduplicate and increment a refcount instead of storing a second copy.

mod memory;
mod sqlite;

pub use memory::InMemoryReferenceStore;
pub use sqlite::SqliteReferenceStore;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::StoreBackend;
use crate::error::SubstrateError;

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Content type of the referenced payload. `content_type` on [`StoreOptions`]
/// carries the free-form MIME-ish string; this enum is the coarse routing
/// tag consulted by [`crate::policy::PolicyManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Blob,
    StageOutput,
    ToolResult,
    Other,
}

/// Storage backend a reference lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Sqlite,
}

/// A handle to stored bytes. Identical payloads share one `Reference` and a
/// refcount instead of duplicating storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub ref_type: ReferenceType,
    pub backend: BackendKind,
    pub created_at: i64,
    /// 0 means no expiry.
    pub expires_at: i64,
}

/// Options accepted by [`ReferenceStore::store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub ref_type: ReferenceType,
    pub content_type: Option<String>,
    /// 0 = no expiry.
    pub ttl_seconds: i64,
    pub compression: bool,
    pub encoding: Option<String>,
    pub compute_checksum: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ref_type: ReferenceType::Blob,
            content_type: None,
            ttl_seconds: 0,
            compression: false,
            encoding: None,
            compute_checksum: false,
        }
    }
}

/// Aggregate counters for a reference store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub total_refs: u64,
    pub total_bytes: u64,
    pub active_refs: u64,
    pub current_bytes: u64,
    pub gc_runs: u64,
    pub eviction_count: u64,
}

/// Computes the content-addressed id for a payload: hex SHA-256.
pub fn content_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed blob storage with refcount GC and TTL.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Stores `bytes`. Returns the existing [`Reference`] (with refcount
    /// incremented) if identical bytes were already stored. Fails
    /// `InvalidInput` on empty bytes.
    async fn store(&self, bytes: &[u8], opts: StoreOptions) -> Result<Reference, SubstrateError>;

    /// Resolves a reference to a defensive copy of its bytes. Fails
    /// `NotFound` if unknown, `Expired` if past TTL (checked regardless of
    /// whether a GC sweep has run).
    async fn resolve(&self, id: &str) -> Result<Vec<u8>, SubstrateError>;

    /// Increments the refcount of an existing reference. Fails `NotFound`
    /// for unknown ids.
    async fn retain(&self, id: &str) -> Result<(), SubstrateError>;

    /// Decrements the refcount of an existing reference, deleting it
    /// immediately if the count drops to zero or below. Fails `NotFound`
    /// for unknown ids.
    async fn release(&self, id: &str) -> Result<(), SubstrateError>;

    /// Lists all live references.
    async fn list(&self) -> Result<Vec<Reference>, SubstrateError>;

    /// Returns aggregate counters.
    async fn stats(&self) -> Result<ReferenceStats, SubstrateError>;

    /// Marks the store closed; subsequent operations fail `Closed`.
    async fn close(&self) -> Result<(), SubstrateError>;
}

/// Builds the backend named by `backend`. `sqlite_path` is ignored for
/// [`StoreBackend::Memory`]. `StoreBackend::Redis` is declared in
/// configuration but not implemented; it fails `InvalidInput` here rather
/// than silently falling back to another backend.
pub fn open(backend: StoreBackend, sqlite_path: impl AsRef<Path>) -> Result<Box<dyn ReferenceStore>, SubstrateError> {
    match backend {
        StoreBackend::Memory => Ok(Box::new(InMemoryReferenceStore::new())),
        StoreBackend::Sqlite => Ok(Box::new(SqliteReferenceStore::open(sqlite_path)?)),
        StoreBackend::Redis => Err(SubstrateError::InvalidInput(
            "store.backend = redis is declared but not implemented".into(),
        )),
    }
}
