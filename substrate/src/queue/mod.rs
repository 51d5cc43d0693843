//! Durable per-agent priority FIFO with ack/retry and request/response
//! correlation.
//!
//! Mirrors the reference store's "open a connection per blocking call"
//! pattern: no connection is held across awaits, so multiple concurrent
//! callers never contend on a single `rusqlite::Connection`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SubstrateError;

/// Delivery priority; higher values are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    fn to_i64(self) -> i64 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Critical => 3,
        }
    }

    fn from_i64(v: i64) -> Self {
        match v {
            0 => MessagePriority::Low,
            1 => MessagePriority::Normal,
            2 => MessagePriority::High,
            _ => MessagePriority::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InFlight,
    Acked,
    Failed,
    Expired,
}

impl MessageStatus {
    fn to_i64(self) -> i64 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::InFlight => 1,
            MessageStatus::Acked => 2,
            MessageStatus::Failed => 3,
            MessageStatus::Expired => 4,
        }
    }

    fn from_i64(v: i64) -> Self {
        match v {
            0 => MessageStatus::Pending,
            1 => MessageStatus::InFlight,
            2 => MessageStatus::Acked,
            3 => MessageStatus::Failed,
            _ => MessageStatus::Expired,
        }
    }
}

/// A durable queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub correlation_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub from_agent: String,
    pub to_agent: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub max_retries: u32,
    pub ttl_seconds: i64,
}

impl Default for EnqueueRequest {
    fn default() -> Self {
        Self {
            from_agent: String::new(),
            to_agent: String::new(),
            message_type: String::new(),
            payload: Vec::new(),
            metadata: HashMap::new(),
            priority: MessagePriority::Normal,
            correlation_id: None,
            in_reply_to: None,
            max_retries: 3,
            ttl_seconds: 0,
        }
    }
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
        CREATE TABLE IF NOT EXISTS message_queue (
            id TEXT PRIMARY KEY,
            from_agent TEXT,
            to_agent TEXT,
            message_type TEXT,
            payload BLOB,
            metadata_json TEXT,
            priority INTEGER,
            status INTEGER,
            correlation_id TEXT,
            in_reply_to TEXT,
            retry_count INTEGER DEFAULT 0,
            max_retries INTEGER DEFAULT 3,
            created_at INTEGER,
            expires_at INTEGER DEFAULT 0
        )
        "#,
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_to_agent_status ON message_queue(to_agent, status)",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_status ON message_queue(status)", [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expires_at ON message_queue(expires_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_correlation_id ON message_queue(correlation_id)",
        [],
    )?;
    Ok(conn)
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<QueueMessage> {
    let metadata_json: String = row.get(5)?;
    let metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
    Ok(QueueMessage {
        id: row.get(0)?,
        from_agent: row.get(1)?,
        to_agent: row.get(2)?,
        message_type: row.get(3)?,
        payload: row.get(4)?,
        metadata,
        priority: MessagePriority::from_i64(row.get(6)?),
        status: MessageStatus::from_i64(row.get(7)?),
        correlation_id: row.get(8)?,
        in_reply_to: row.get(9)?,
        retry_count: row.get::<_, i64>(10)? as u32,
        max_retries: row.get::<_, i64>(11)? as u32,
        created_at: row.get(12)?,
        expires_at: row.get(13)?,
    })
}

const SELECT_COLUMNS: &str = "id, from_agent, to_agent, message_type, payload, metadata_json, priority, status, correlation_id, in_reply_to, retry_count, max_retries, created_at, expires_at";

type AgentValidator = dyn Fn(&str) -> bool + Send + Sync;

/// Durable per-agent priority FIFO with ack/retry and request/response
/// correlation.
pub struct MessageQueue {
    db_path: PathBuf,
    closed: Arc<AtomicBool>,
    wake: DashMap<String, Arc<Notify>>,
    /// Keyed by `correlation_id`; value is `(original from_agent, response channel)`.
    correlation_waiters: DashMap<String, (String, oneshot::Sender<Vec<u8>>)>,
    validator: Option<Arc<AgentValidator>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl MessageQueue {
    /// Opens (creating if absent) the database at `path` and moves any
    /// `InFlight` rows left over from a prior process back to `Pending`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SubstrateError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = open(&db_path)?;
        conn.execute(
            "UPDATE message_queue SET status = ?1 WHERE status = ?2",
            params![MessageStatus::Pending.to_i64(), MessageStatus::InFlight.to_i64()],
        )?;
        Ok(Self {
            db_path,
            closed: Arc::new(AtomicBool::new(false)),
            wake: DashMap::new(),
            correlation_waiters: DashMap::new(),
            validator: None,
            sweep_task: None,
        })
    }

    /// Opens the database and starts a background sweep that marks overdue
    /// `Pending` rows `Expired` every `interval`.
    pub fn open_with_expiry_sweep(path: impl AsRef<Path>, interval: Duration) -> Result<Self, SubstrateError> {
        let mut queue = Self::open(path)?;
        let db_path = queue.db_path.clone();
        let closed = queue.closed.clone();
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
                    conn.execute(
                        "UPDATE message_queue SET status = ?1 WHERE status = ?2 AND expires_at > 0 AND expires_at < ?3",
                        params![MessageStatus::Expired.to_i64(), MessageStatus::Pending.to_i64(), now_secs()],
                    )
                })
                .await;
                if let Ok(Ok(n)) = result {
                    if n > 0 {
                        tracing::debug!(expired = n, "queue sweep expired pending messages");
                    }
                }
            }
        });
        queue.sweep_task = Some(task);
        Ok(queue)
    }

    /// Installs a predicate consulted on `Enqueue`; rejecting agents produce
    /// [`SubstrateError::UnknownAgent`].
    pub fn set_agent_validator<F>(&mut self, validator: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
    }

    fn check_closed(&self) -> Result<(), SubstrateError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SubstrateError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify_for(&self, agent_id: &str) -> Arc<Notify> {
        self.wake.entry(agent_id.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    /// Persists `req`, unless it carries a `correlation_id` matching a live
    /// [`Self::send_and_receive`] waiter whose original caller is exactly
    /// `req.to_agent` — the response invariant that prevents a request from
    /// self-routing to its own waiter. In that case the payload is handed
    /// to the waiter directly and durable storage is bypassed entirely; if
    /// the waiter's receiver has already been dropped, the message falls
    /// through to normal durable queuing.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<QueueMessage, SubstrateError> {
        self.check_closed()?;
        if req.to_agent.is_empty() || req.from_agent.is_empty() {
            return Err(SubstrateError::InvalidInput("from_agent/to_agent required".into()));
        }
        if let Some(validator) = &self.validator {
            if !validator(&req.to_agent) {
                return Err(SubstrateError::UnknownAgent(req.to_agent));
            }
        }

        if let Some(corr) = req.correlation_id.clone() {
            let is_response_to_original_requester = self
                .correlation_waiters
                .get(&corr)
                .map(|entry| entry.value().0 == req.to_agent)
                .unwrap_or(false);
            if is_response_to_original_requester {
                if let Some((_, (_, sender))) = self.correlation_waiters.remove(&corr) {
                    match sender.send(req.payload.clone()) {
                        Ok(()) => {
                            return Ok(QueueMessage {
                                id: Uuid::new_v4().to_string(),
                                from_agent: req.from_agent,
                                to_agent: req.to_agent,
                                message_type: req.message_type,
                                payload: req.payload,
                                metadata: req.metadata,
                                priority: req.priority,
                                status: MessageStatus::Acked,
                                correlation_id: Some(corr),
                                in_reply_to: req.in_reply_to,
                                retry_count: 0,
                                max_retries: req.max_retries,
                                created_at: now_secs(),
                                expires_at: 0,
                            });
                        }
                        Err(_dropped_receiver) => {
                            // Waiter gave up; fall through to durable queuing below.
                        }
                    }
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let created_at = now_secs();
        let expires_at = if req.ttl_seconds > 0 { created_at + req.ttl_seconds } else { 0 };
        let db_path = self.db_path.clone();

        let message = QueueMessage {
            id: id.clone(),
            from_agent: req.from_agent.clone(),
            to_agent: req.to_agent.clone(),
            message_type: req.message_type.clone(),
            payload: req.payload.clone(),
            metadata: req.metadata.clone(),
            priority: req.priority,
            status: MessageStatus::Pending,
            correlation_id: req.correlation_id.clone(),
            in_reply_to: req.in_reply_to.clone(),
            retry_count: 0,
            max_retries: req.max_retries,
            created_at,
            expires_at,
        };

        let insert = message.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SubstrateError> {
            let conn = open(&db_path)?;
            let metadata_json = serde_json::to_string(&insert.metadata)?;
            conn.execute(
                "INSERT INTO message_queue (id, from_agent, to_agent, message_type, payload, metadata_json, priority, status, correlation_id, in_reply_to, retry_count, max_retries, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    insert.id,
                    insert.from_agent,
                    insert.to_agent,
                    insert.message_type,
                    insert.payload,
                    metadata_json,
                    insert.priority.to_i64(),
                    insert.status.to_i64(),
                    insert.correlation_id,
                    insert.in_reply_to,
                    insert.retry_count,
                    insert.max_retries,
                    insert.created_at,
                    insert.expires_at,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))??;

        self.notify_for(&req.to_agent).notify_one();
        Ok(message)
    }

    /// Returns the highest-priority, oldest `Pending` message addressed to
    /// `agent_id`, marking it `InFlight`; `None` if the queue is empty.
    pub async fn dequeue(&self, agent_id: &str) -> Result<Option<QueueMessage>, SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        let agent_id = agent_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<QueueMessage>, SubstrateError> {
            let conn = open(&db_path)?;
            conn.execute(
                "UPDATE message_queue SET status = ?1 WHERE status = ?2 AND to_agent = ?3 AND expires_at > 0 AND expires_at < ?4",
                params![MessageStatus::Expired.to_i64(), MessageStatus::Pending.to_i64(), agent_id, now_secs()],
            )?;

            let sql = format!(
                "SELECT {} FROM message_queue WHERE to_agent = ?1 AND status = ?2 ORDER BY priority DESC, created_at ASC LIMIT 1",
                SELECT_COLUMNS
            );
            let found: Option<QueueMessage> = conn
                .query_row(&sql, params![agent_id, MessageStatus::Pending.to_i64()], row_to_message)
                .ok();
            if let Some(ref msg) = found {
                conn.execute(
                    "UPDATE message_queue SET status = ?1 WHERE id = ?2",
                    params![MessageStatus::InFlight.to_i64(), msg.id],
                )?;
            }
            Ok(found.map(|m| QueueMessage { status: MessageStatus::InFlight, ..m }))
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    /// Dequeues, waiting up to `timeout` for a message to arrive if the
    /// queue is currently empty. Cancelled early if `cancel` fires.
    pub async fn wait_for_message(
        &self,
        agent_id: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<QueueMessage, SubstrateError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check_closed()?;
            if let Some(msg) = self.dequeue(agent_id).await? {
                return Ok(msg);
            }
            let notify = self.notify_for(agent_id);
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(SubstrateError::Timeout(agent_id.to_string()));
            }
            tokio::select! {
                _ = notify.notified() => continue,
                _ = tokio::time::sleep(remaining) => return Err(SubstrateError::Timeout(agent_id.to_string())),
                _ = async {
                    match cancel {
                        Some(c) => c.cancelled().await,
                        None => std::future::pending().await,
                    }
                } => return Err(SubstrateError::Cancelled),
            }
        }
    }

    pub async fn acknowledge(&self, message_id: &str) -> Result<(), SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        let message_id = message_id.to_string();
        let message_id_for_query = message_id.clone();
        let updated = tokio::task::spawn_blocking(move || -> rusqlite::Result<usize> {
            let conn = open(&db_path)?;
            conn.execute(
                "UPDATE message_queue SET status = ?1 WHERE id = ?2 AND status = ?3",
                params![MessageStatus::Acked.to_i64(), message_id_for_query, MessageStatus::InFlight.to_i64()],
            )
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))??;
        if updated == 0 {
            return Err(SubstrateError::NotFound(format!("in-flight message {}", message_id)));
        }
        Ok(())
    }

    /// Returns a message to `Pending` for another delivery attempt, or marks
    /// it `Failed` and returns [`SubstrateError::MaxRetriesExceeded`] once
    /// `max_retries` is reached.
    pub async fn requeue(&self, message_id: &str) -> Result<(), SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        let id = message_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || -> Result<(String, bool), SubstrateError> {
            let conn = open(&db_path)?;
            let (retry_count, max_retries, to_agent): (i64, i64, String) = conn
                .query_row(
                    "SELECT retry_count, max_retries, to_agent FROM message_queue WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(|_| SubstrateError::NotFound(id.clone()))?;

            let next_retry = retry_count + 1;
            if next_retry >= max_retries {
                conn.execute(
                    "UPDATE message_queue SET status = ?1, retry_count = ?2 WHERE id = ?3",
                    params![MessageStatus::Failed.to_i64(), next_retry, id],
                )?;
                Ok((to_agent, true))
            } else {
                conn.execute(
                    "UPDATE message_queue SET status = ?1, retry_count = ?2 WHERE id = ?3",
                    params![MessageStatus::Pending.to_i64(), next_retry, id],
                )?;
                Ok((to_agent, false))
            }
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))??;

        let (to_agent, exhausted) = outcome;
        if exhausted {
            return Err(SubstrateError::MaxRetriesExceeded(message_id.to_string()));
        }
        self.notify_for(&to_agent).notify_one();
        Ok(())
    }

    pub async fn send(
        &self,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
        priority: MessagePriority,
    ) -> Result<QueueMessage, SubstrateError> {
        self.enqueue(EnqueueRequest {
            from_agent: from_agent.to_string(),
            to_agent: to_agent.to_string(),
            message_type: message_type.to_string(),
            payload,
            metadata,
            priority,
            ..EnqueueRequest::default()
        })
        .await
    }

    /// Sends `payload` to `to_agent` and awaits a correlated response, up to
    /// `timeout`. If `to_agent` enqueues a message carrying the same
    /// correlation id back to `from_agent` while this call is still
    /// waiting, the response is delivered directly through an in-process
    /// channel and never touches durable storage (see [`Self::enqueue`]).
    pub async fn send_and_receive(
        &self,
        from_agent: &str,
        to_agent: &str,
        message_type: &str,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
        priority: MessagePriority,
        timeout: Duration,
    ) -> Result<Vec<u8>, SubstrateError> {
        self.check_closed()?;
        let correlation_id = format!("corr-{}-{}", from_agent, Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel();
        self.correlation_waiters.insert(correlation_id.clone(), (from_agent.to_string(), tx));

        if let Err(e) = self
            .enqueue(EnqueueRequest {
                from_agent: from_agent.to_string(),
                to_agent: to_agent.to_string(),
                message_type: message_type.to_string(),
                payload,
                metadata,
                priority,
                correlation_id: Some(correlation_id.clone()),
                ..EnqueueRequest::default()
            })
            .await
        {
            self.correlation_waiters.remove(&correlation_id);
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, rx).await;
        self.correlation_waiters.remove(&correlation_id);
        match result {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(SubstrateError::Cancelled),
            Err(_) => Err(SubstrateError::Timeout(correlation_id)),
        }
    }

    /// Convenience wrapper around [`Self::enqueue`] for replying to a
    /// `correlation_id`: sets `in_reply_to` and lets `enqueue`'s own
    /// response-routing check decide whether delivery bypasses durable
    /// storage (when `to_agent` is the original requester and still
    /// waiting) or falls back to ordinary durable queuing. Returns `true`
    /// iff delivery bypassed durable storage.
    pub async fn respond(
        &self,
        correlation_id: &str,
        from_agent: &str,
        to_agent: &str,
        payload: Vec<u8>,
    ) -> Result<bool, SubstrateError> {
        self.check_closed()?;
        let msg = self
            .enqueue(EnqueueRequest {
                from_agent: from_agent.to_string(),
                to_agent: to_agent.to_string(),
                payload,
                priority: MessagePriority::Normal,
                correlation_id: Some(correlation_id.to_string()),
                in_reply_to: Some(correlation_id.to_string()),
                ..EnqueueRequest::default()
            })
            .await?;
        Ok(msg.status == MessageStatus::Acked)
    }

    pub async fn stats_by_status(&self) -> Result<HashMap<String, u64>, SubstrateError> {
        self.check_closed()?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || -> Result<HashMap<String, u64>, SubstrateError> {
            let conn = open(&db_path)?;
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM message_queue GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                let status: i64 = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })?;
            let mut out = HashMap::new();
            for r in rows {
                let (status, count) = r?;
                out.insert(format!("{:?}", MessageStatus::from_i64(status)), count as u64);
            }
            Ok(out)
        })
        .await
        .map_err(|e| SubstrateError::Storage(e.to_string()))?
    }

    pub async fn close(&self) -> Result<(), SubstrateError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_task.take() {
            task.abort();
        }
    }
}
