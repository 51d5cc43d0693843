//! Priority-tagged out-of-band signal delivery to registered handlers.
//!
//! Every priority gets its own bounded fast-path channel; `Critical`
//! signals that cannot be delivered immediately additionally fall back to a
//! durable sqlite log so a handler that reconnects later can still observe
//! them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::SubstrateError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl InterruptPriority {
    fn buffer_size(self) -> usize {
        match self {
            InterruptPriority::Low => 16,
            InterruptPriority::Normal => 64,
            InterruptPriority::High => 256,
            InterruptPriority::Critical => 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSignal {
    pub id: String,
    pub topic: String,
    pub priority: InterruptPriority,
    pub payload: Vec<u8>,
    pub sent_at: i64,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn open(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS interrupt_log (
            id TEXT PRIMARY KEY,
            topic TEXT,
            payload BLOB,
            sent_at INTEGER,
            delivered INTEGER DEFAULT 0
        )
        "#,
        [],
    )?;
    Ok(conn)
}

struct Handler {
    sender: mpsc::Sender<InterruptSignal>,
}

/// Priority-tagged signal delivery with a durable fallback log for
/// `Critical` signals that the fast path cannot absorb.
pub struct InterruptChannel {
    handlers: RwLock<HashMap<String, Handler>>,
    log_path: Option<PathBuf>,
    closed: Arc<AtomicBool>,
}

impl InterruptChannel {
    /// Fast-path only; `Critical` signals that can't be delivered are
    /// dropped with a warning.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            log_path: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Adds a durable fallback log at `path` for `Critical` signals that
    /// overflow every matching handler's fast-path buffer.
    pub fn with_durable_log(path: impl AsRef<Path>) -> Result<Self, SubstrateError> {
        let log_path = path.as_ref().to_path_buf();
        open(&log_path)?;
        Ok(Self {
            handlers: RwLock::new(HashMap::new()),
            log_path: Some(log_path),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn check_closed(&self) -> Result<(), SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SubstrateError::Closed)
        } else {
            Ok(())
        }
    }

    /// Registers a handler keyed by `handler_id`, sized by the priority it
    /// cares most about (`Critical` gets the largest fast-path buffer).
    pub async fn register(
        &self,
        handler_id: &str,
        priority: InterruptPriority,
    ) -> Result<mpsc::Receiver<InterruptSignal>, SubstrateError> {
        self.check_closed()?;
        let (tx, rx) = mpsc::channel(priority.buffer_size());
        let mut handlers = self.handlers.write().await;
        handlers.insert(handler_id.to_string(), Handler { sender: tx });
        Ok(rx)
    }

    pub async fn deregister(&self, handler_id: &str) -> Result<(), SubstrateError> {
        let mut handlers = self.handlers.write().await;
        if handlers.remove(handler_id).is_none() {
            return Err(SubstrateError::NotFound(format!("handler {}", handler_id)));
        }
        Ok(())
    }

    /// Delivers to a single handler. Fails `NotFound` if unregistered.
    pub async fn send(
        &self,
        handler_id: &str,
        topic: &str,
        priority: InterruptPriority,
        payload: Vec<u8>,
    ) -> Result<(), SubstrateError> {
        self.check_closed()?;
        let signal = InterruptSignal {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            priority,
            payload,
            sent_at: now_secs(),
        };

        let handlers = self.handlers.read().await;
        let handler = handlers
            .get(handler_id)
            .ok_or_else(|| SubstrateError::NotFound(format!("handler {}", handler_id)))?;

        match handler.sender.try_send(signal.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) if priority == InterruptPriority::Critical => {
                drop(handlers);
                self.log_fallback(signal).await
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(handler_id, topic, "interrupt fast path full, dropping signal");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SubstrateError::NotFound(format!("handler {}", handler_id)))
            }
        }
    }

    /// Best-effort broadcast to every registered handler.
    pub async fn broadcast(&self, topic: &str, priority: InterruptPriority, payload: Vec<u8>) -> Result<u64, SubstrateError> {
        self.check_closed()?;
        let signal = InterruptSignal {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            priority,
            payload,
            sent_at: now_secs(),
        };
        let handlers = self.handlers.read().await;
        let mut delivered = 0u64;
        let mut overflowed = Vec::new();
        for handler in handlers.values() {
            match handler.sender.try_send(signal.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) if priority == InterruptPriority::Critical => {
                    overflowed.push(());
                }
                _ => {}
            }
        }
        drop(handlers);
        for _ in overflowed {
            self.log_fallback(signal.clone()).await?;
        }
        Ok(delivered)
    }

    async fn log_fallback(&self, signal: InterruptSignal) -> Result<(), SubstrateError> {
        let Some(log_path) = self.log_path.clone() else {
            tracing::warn!(signal_id = %signal.id, "critical interrupt dropped: no durable log configured");
            return Ok(());
        };
        tokio::task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = open(&log_path)?;
            conn.execute(
                "INSERT INTO interrupt_log (id, topic, payload, sent_at, delivered) VALUES (?1, ?2, ?3, ?4, 0)",
                params![signal.id, signal.topic, signal.payload, signal.sent_at],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))??;
        Ok(())
    }

    /// Reads undelivered `Critical` signals from the durable log, marking
    /// them delivered.
    pub async fn drain_durable_log(&self) -> Result<Vec<InterruptSignal>, SubstrateError> {
        let Some(log_path) = self.log_path.clone() else {
            return Ok(Vec::new());
        };
        tokio::task::spawn_blocking(move || -> Result<Vec<InterruptSignal>, SubstrateError> {
            let conn = open(&log_path)?;
            let mut stmt = conn.prepare(
                "SELECT id, topic, payload, sent_at FROM interrupt_log WHERE delivered = 0 ORDER BY sent_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(InterruptSignal {
                    id: row.get(0)?,
                    topic: row.get(1)?,
                    priority: InterruptPriority::Critical,
                    payload: row.get(2)?,
                    sent_at: row.get(3)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            conn.execute("UPDATE interrupt_log SET delivered = 1 WHERE delivered = 0", [])?;
            Ok(out)
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    /// Closes every handler channel, waiting up to 30s for in-flight sends
    /// to drain before forcing closure.
    pub async fn shutdown(&self) -> Result<(), SubstrateError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut handlers = self.handlers.write().await;
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            for (_, handler) in handlers.drain() {
                drop(handler.sender);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("interrupt channel shutdown exceeded grace period");
        }
        Ok(())
    }
}

impl Default for InterruptChannel {
    fn default() -> Self {
        Self::new()
    }
}
