//! Durable `ReferenceStore` backend: a single-file sqlite database with WAL
//! journaling, matching the `reference_store` schema.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::task::JoinHandle;

use super::{content_id, now_secs, BackendKind, Reference, ReferenceStats, ReferenceType, StoreOptions};
use crate::error::SubstrateError;
use crate::reference_store::ReferenceStore;

fn ref_type_to_i64(t: ReferenceType) -> i64 {
    match t {
        ReferenceType::Blob => 0,
        ReferenceType::StageOutput => 1,
        ReferenceType::ToolResult => 2,
        ReferenceType::Other => 3,
    }
}

fn ref_type_from_i64(v: i64) -> ReferenceType {
    match v {
        0 => ReferenceType::Blob,
        1 => ReferenceType::StageOutput,
        2 => ReferenceType::ToolResult,
        _ => ReferenceType::Other,
    }
}

fn open(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS reference_store (
            id TEXT PRIMARY KEY,
            type INTEGER,
            store INTEGER,
            data BLOB,
            ref_count INTEGER DEFAULT 1,
            created_at INTEGER,
            expires_at INTEGER DEFAULT 0,
            size_bytes INTEGER
        )
        "#,
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expires_at ON reference_store(expires_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ref_count ON reference_store(ref_count)",
        [],
    )?;
    Ok(conn)
}

/// Durable, single-file sqlite-backed [`ReferenceStore`].
pub struct SqliteReferenceStore {
    db_path: PathBuf,
    closed: Arc<AtomicBool>,
    gc_task: Option<JoinHandle<()>>,
}

impl SqliteReferenceStore {
    /// Opens (creating if absent) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SubstrateError> {
        let db_path = path.as_ref().to_path_buf();
        open(&db_path)?;
        Ok(Self {
            db_path,
            closed: Arc::new(AtomicBool::new(false)),
            gc_task: None,
        })
    }

    /// Opens the database and starts a background GC sweep every `interval`.
    pub fn open_with_gc_interval(
        path: impl AsRef<Path>,
        interval: Duration,
    ) -> Result<Self, SubstrateError> {
        let mut store = Self::open(path)?;
        let db_path = store.db_path.clone();
        let closed = store.closed.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let path = db_path.clone();
                let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<usize> {
                    let conn = open(&path)?;
                    let now = now_secs();
                    let evicted = conn.execute(
                        "DELETE FROM reference_store WHERE (expires_at > 0 AND expires_at < ?1) OR ref_count <= 0",
                        params![now],
                    )?;
                    Ok(evicted)
                })
                .await;
                match result {
                    Ok(Ok(evicted)) if evicted > 0 => {
                        tracing::debug!(evicted, "sqlite reference store gc sweep evicted entries");
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "reference store gc sweep failed"),
                    Err(e) => tracing::warn!(error = %e, "reference store gc sweep task panicked"),
                    _ => {}
                }
            }
        });
        store.gc_task = Some(task);
        Ok(store)
    }

    fn check_closed(&self) -> Result<(), SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SubstrateError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for SqliteReferenceStore {
    fn drop(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ReferenceStore for SqliteReferenceStore {
    async fn store(&self, bytes: &[u8], opts: StoreOptions) -> Result<Reference, SubstrateError> {
        self.check_closed()?;
        if bytes.is_empty() {
            return Err(SubstrateError::InvalidInput("empty bytes".into()));
        }
        let id = content_id(bytes);
        let db_path = self.db_path.clone();
        let bytes = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> Result<Reference, SubstrateError> {
            let conn = open(&db_path)?;
            let existing: Option<(i64, i64, i64)> = conn
                .query_row(
                    "SELECT type, created_at, expires_at FROM reference_store WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .ok();

            if let Some((ty, created_at, expires_at)) = existing {
                conn.execute(
                    "UPDATE reference_store SET ref_count = ref_count + 1 WHERE id = ?1",
                    params![id],
                )?;
                return Ok(Reference {
                    id,
                    ref_type: ref_type_from_i64(ty),
                    backend: BackendKind::Sqlite,
                    created_at,
                    expires_at,
                });
            }

            let created_at = now_secs();
            let expires_at = if opts.ttl_seconds > 0 {
                created_at + opts.ttl_seconds
            } else {
                0
            };
            conn.execute(
                "INSERT INTO reference_store (id, type, store, data, ref_count, created_at, expires_at, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)",
                params![
                    id,
                    ref_type_to_i64(opts.ref_type),
                    1i64,
                    bytes,
                    created_at,
                    expires_at,
                    bytes.len() as i64
                ],
            )?;
            Ok(Reference {
                id,
                ref_type: opts.ref_type,
                backend: BackendKind::Sqlite,
                created_at,
                expires_at,
            })
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    async fn resolve(&self, id: &str) -> Result<Vec<u8>, SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, SubstrateError> {
            let conn = open(&db_path)?;
            let row: Option<(Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT data, expires_at FROM reference_store WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .ok();
            let (data, expires_at) =
                row.ok_or_else(|| SubstrateError::NotFound(id.clone()))?;
            if expires_at > 0 && now_secs() > expires_at {
                return Err(SubstrateError::Expired(id));
            }
            Ok(data)
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    async fn retain(&self, id: &str) -> Result<(), SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), SubstrateError> {
            let conn = open(&db_path)?;
            let updated = conn.execute(
                "UPDATE reference_store SET ref_count = ref_count + 1 WHERE id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(SubstrateError::NotFound(id));
            }
            Ok(())
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    async fn release(&self, id: &str) -> Result<(), SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), SubstrateError> {
            let conn = open(&db_path)?;
            let updated = conn.execute(
                "UPDATE reference_store SET ref_count = ref_count - 1 WHERE id = ?1",
                params![id],
            )?;
            if updated == 0 {
                return Err(SubstrateError::NotFound(id));
            }
            conn.execute(
                "DELETE FROM reference_store WHERE id = ?1 AND ref_count <= 0",
                params![id],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    async fn list(&self) -> Result<Vec<Reference>, SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Reference>, SubstrateError> {
            let conn = open(&db_path)?;
            let mut stmt =
                conn.prepare("SELECT id, type, created_at, expires_at FROM reference_store")?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let ty: i64 = row.get(1)?;
                let created_at: i64 = row.get(2)?;
                let expires_at: i64 = row.get(3)?;
                Ok(Reference {
                    id,
                    ref_type: ref_type_from_i64(ty),
                    backend: BackendKind::Sqlite,
                    created_at,
                    expires_at,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    async fn stats(&self) -> Result<ReferenceStats, SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<ReferenceStats, SubstrateError> {
            let conn = open(&db_path)?;
            let (active_refs, current_bytes): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM reference_store",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(ReferenceStats {
                total_refs: active_refs as u64,
                total_bytes: current_bytes as u64,
                active_refs: active_refs as u64,
                current_bytes: current_bytes as u64,
                gc_runs: 0,
                eviction_count: 0,
            })
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    async fn close(&self) -> Result<(), SubstrateError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_resolve_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteReferenceStore::open(dir.path().join("refs.db")).unwrap();
        let r = store
            .store(b"durable payload", StoreOptions::default())
            .await
            .unwrap();
        let bytes = store.resolve(&r.id).await.unwrap();
        assert_eq!(bytes, b"durable payload");
    }

    #[tokio::test]
    async fn duplicate_store_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteReferenceStore::open(dir.path().join("refs.db")).unwrap();
        let r1 = store.store(b"dup", StoreOptions::default()).await.unwrap();
        let r2 = store.store(b"dup", StoreOptions::default()).await.unwrap();
        assert_eq!(r1.id, r2.id);
    }

    #[tokio::test]
    async fn release_to_zero_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteReferenceStore::open(dir.path().join("refs.db")).unwrap();
        let r = store.store(b"once", StoreOptions::default()).await.unwrap();
        store.release(&r.id).await.unwrap();
        assert!(matches!(
            store.resolve(&r.id).await,
            Err(SubstrateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reopen_after_restart_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refs.db");
        let id = {
            let store = SqliteReferenceStore::open(&path).unwrap();
            store
                .store(b"survives restart", StoreOptions::default())
                .await
                .unwrap()
                .id
        };
        let store = SqliteReferenceStore::open(&path).unwrap();
        let bytes = store.resolve(&id).await.unwrap();
        assert_eq!(bytes, b"survives restart");
    }
}
