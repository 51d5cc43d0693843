//! Topic-addressed publish/subscribe with glob filtering, per-subscriber
//! filters, and non-blocking, best-effort fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::SubstrateError;

const DEFAULT_SUBSCRIPTION_BUFFER: usize = 100;

/// A message delivered on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub topic: String,
    pub from_agent: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub timestamp_ms: i64,
}

/// A subscriber-side filter evaluated against each candidate [`BusMessage`]
/// whose topic already matches the subscription's pattern.
///
/// A message passes iff (no `from_agents` filter, or `from_agent` is a
/// member) AND (every `metadata` entry here has the same value under the
/// same key on the message).
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub from_agents: Option<HashSet<String>>,
    pub metadata: Option<HashMap<String, String>>,
}

impl SubscriptionFilter {
    fn accepts(&self, msg: &BusMessage) -> bool {
        if let Some(from_agents) = &self.from_agents {
            if !from_agents.contains(&msg.from_agent) {
                return false;
            }
        }
        if let Some(metadata) = &self.metadata {
            for (k, v) in metadata {
                match msg.metadata.get(k) {
                    Some(actual) if actual == v => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// A live subscription handle.
pub struct Subscription {
    pub id: u64,
    pub agent_id: String,
    pub topic_pattern: String,
    pub filter: SubscriptionFilter,
    pub buffer_size: usize,
    pub created_at: i64,
    pub receiver: mpsc::Receiver<BusMessage>,
}

/// Result of a single [`MessageBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: u64,
    pub dropped: u64,
}

/// Per-topic delivery counters, keyed by the literal topic a message was
/// actually published on (not the subscriber's pattern).
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicStats {
    pub published_count: u64,
    pub delivered_count: u64,
    pub dropped_count: u64,
    pub subscriber_count: u64,
    pub created_at: i64,
    pub last_publish_at: i64,
}

struct Sub {
    id: u64,
    agent_id: String,
    topic_pattern: String,
    filter: SubscriptionFilter,
    buffer_size: usize,
    created_at: i64,
    sender: mpsc::Sender<BusMessage>,
    notify: Mutex<Option<mpsc::Sender<()>>>,
}

struct Counters {
    published_count: AtomicU64,
    delivered_count: AtomicU64,
    dropped_count: AtomicU64,
    created_at: i64,
    last_publish_at: AtomicI64,
}

impl Counters {
    fn new(now: i64) -> Self {
        Self {
            published_count: AtomicU64::new(0),
            delivered_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            created_at: now,
            last_publish_at: AtomicI64::new(now),
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Topic-addressed publish/subscribe bus.
///
/// Publish never blocks on a slow subscriber: delivery to each matching,
/// filter-accepting subscription is attempted with `try_send`, and a full
/// channel is counted as dropped rather than awaited.
pub struct MessageBus {
    subscriptions: RwLock<Vec<Sub>>,
    next_sub_id: AtomicU64,
    counters: RwLock<HashMap<String, Counters>>,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_sub_id: AtomicU64::new(1),
            counters: RwLock::new(HashMap::new()),
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

    /// Registers a subscription; topics matching `topic_pattern` whose
    /// sender passes `filter` are delivered to the returned receiver until
    /// [`Self::unsubscribe`] is called or the bus is closed.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        topic_pattern: &str,
        filter: SubscriptionFilter,
        buffer_size: usize,
    ) -> Result<Subscription, SubstrateError> {
        self.check_closed()?;
        if agent_id.is_empty() {
            return Err(SubstrateError::InvalidInput("empty agent id".into()));
        }
        if topic_pattern.is_empty() {
            return Err(SubstrateError::InvalidInput("empty subscription pattern".into()));
        }
        let buffer_size = if buffer_size == 0 { DEFAULT_SUBSCRIPTION_BUFFER } else { buffer_size };
        let (tx, rx) = mpsc::channel(buffer_size);
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let created_at = now_millis();

        let mut subs = self.subscriptions.write().await;
        subs.push(Sub {
            id,
            agent_id: agent_id.to_string(),
            topic_pattern: topic_pattern.to_string(),
            filter: filter.clone(),
            buffer_size,
            created_at,
            sender: tx,
            notify: Mutex::new(None),
        });

        Ok(Subscription {
            id,
            agent_id: agent_id.to_string(),
            topic_pattern: topic_pattern.to_string(),
            filter,
            buffer_size,
            created_at,
            receiver: rx,
        })
    }

    /// Registers a capacity-1 notification channel for an existing
    /// subscription; the bus sends to it (non-blocking) after each
    /// successful delivery to that subscription, letting an agent wake up
    /// cheaply without polling the receive channel.
    pub async fn register_notification_channel(&self, subscription_id: u64) -> Result<mpsc::Receiver<()>, SubstrateError> {
        let subs = self.subscriptions.read().await;
        let sub = subs
            .iter()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| SubstrateError::NotFound(format!("subscription {}", subscription_id)))?;
        let (tx, rx) = mpsc::channel(1);
        *sub.notify.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    pub async fn unsubscribe(&self, subscription_id: u64) -> Result<(), SubstrateError> {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != subscription_id);
        if subs.len() == before {
            return Err(SubstrateError::NotFound(format!("subscription {}", subscription_id)));
        }
        Ok(())
    }

    /// Publishes `payload` (with `metadata`) from `from_agent` to `topic`.
    /// Delivery is attempted on every subscription whose pattern matches
    /// `topic` and whose filter accepts the message; a full subscriber
    /// channel is skipped and counted, never awaited.
    pub async fn publish(
        &self,
        topic: &str,
        from_agent: &str,
        payload: Vec<u8>,
        metadata: HashMap<String, String>,
    ) -> Result<PublishOutcome, SubstrateError> {
        self.check_closed()?;
        if topic.is_empty() {
            return Err(SubstrateError::InvalidInput("empty topic".into()));
        }
        if from_agent.is_empty() {
            return Err(SubstrateError::InvalidInput("empty agent id".into()));
        }

        let now = now_millis();
        let message = BusMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            from_agent: from_agent.to_string(),
            payload,
            metadata,
            timestamp_ms: now,
        };

        let mut counters = self.counters.write().await;
        let entry = counters.entry(topic.to_string()).or_insert_with(|| Counters::new(now));
        entry.published_count.fetch_add(1, Ordering::Relaxed);
        entry.last_publish_at.store(now, Ordering::Relaxed);
        drop(counters);

        let subs = self.subscriptions.read().await;
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for sub in subs.iter() {
            if !crate::glob::topic_pattern_match(&sub.topic_pattern, topic) {
                continue;
            }
            if !sub.filter.accepts(&message) {
                continue;
            }
            match sub.sender.try_send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    if let Some(notify_tx) = sub.notify.lock().unwrap().as_ref() {
                        let _ = notify_tx.try_send(());
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::debug!(topic, subscription_id = sub.id, "bus subscriber buffer full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped += 1;
                }
            }
        }
        drop(subs);

        let counters = self.counters.read().await;
        if let Some(entry) = counters.get(topic) {
            entry.delivered_count.fetch_add(delivered, Ordering::Relaxed);
            entry.dropped_count.fetch_add(dropped, Ordering::Relaxed);
        }
        Ok(PublishOutcome { delivered, dropped })
    }

    pub async fn topic_stats(&self, topic: &str) -> TopicStats {
        let counters = self.counters.read().await;
        let subs = self.subscriptions.read().await;
        let subscriber_count = subs
            .iter()
            .filter(|s| crate::glob::topic_pattern_match(&s.topic_pattern, topic))
            .count() as u64;
        match counters.get(topic) {
            Some(c) => TopicStats {
                published_count: c.published_count.load(Ordering::Relaxed),
                delivered_count: c.delivered_count.load(Ordering::Relaxed),
                dropped_count: c.dropped_count.load(Ordering::Relaxed),
                subscriber_count,
                created_at: c.created_at,
                last_publish_at: c.last_publish_at.load(Ordering::Relaxed),
            },
            None => TopicStats {
                subscriber_count,
                ..Default::default()
            },
        }
    }

    /// Lists every topic that has been published to at least once.
    pub async fn list_topics(&self) -> Vec<String> {
        self.counters.read().await.keys().cloned().collect()
    }

    pub async fn close(&self) -> Result<(), SubstrateError> {
        self.closed.store(true, Ordering::SeqCst);
        let mut subs = self.subscriptions.write().await;
        subs.clear();
        Ok(())
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle convenience alias; the bus is cheap to clone behind an `Arc`.
pub type SharedMessageBus = Arc<MessageBus>;
