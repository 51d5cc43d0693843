//! # Substrate
//!
//! A multi-agent communication substrate and iterative workflow orchestrator.
//!
//! Four coordinated communication modes, plus a staged execution engine built
//! on top of them:
//!
//! - [`reference_store`]: content-addressed blob storage with refcount GC and
//!   TTL ([`ReferenceStore`], [`InMemoryReferenceStore`], [`SqliteReferenceStore`]).
//! - [`policy`]: value-vs-reference routing per message type and size
//!   ([`PolicyManager`]).
//! - [`shared_memory`]: namespaced, versioned key-value store with watchers,
//!   compression, and agent scoping ([`SharedMemoryStore`]).
//! - [`bus`]: topic pub/sub with glob filtering and non-blocking fan-out
//!   ([`MessageBus`]).
//! - [`queue`]: durable per-agent priority FIFO with ack/retry and
//!   request/response correlation ([`MessageQueue`]).
//! - [`executor`]: staged agent execution with restart, validation retries,
//!   and context truncation ([`IterativePipelineExecutor`]).
//! - [`interrupt`]: priority-tagged targeted/broadcast signal delivery
//!   ([`InterruptChannel`]).
//!
//! Everything else — the agent-invocation interface, prompt construction
//! beyond placeholder substitution, authentication, and the on-wire RPC
//! format — is an external collaborator.
//!
//! Key types are re-exported at crate root:
//! `use substrate::{MessageBus, MessageQueue, SharedMemoryStore};`.

pub mod bus;
pub mod config;
pub mod error;
pub mod executor;
pub mod glob;
pub mod interrupt;
pub mod policy;
pub mod queue;
pub mod reference_store;
pub mod shared_memory;

pub use bus::{BusMessage, MessageBus, PublishOutcome, SharedMessageBus, Subscription, SubscriptionFilter, TopicStats};
pub use config::{AutoPromoteConfig, Config, ConfigError, GcConfig, GcStrategy, PoliciesConfig, StoreBackend, StoreConfig, WorkflowConfig};
pub use error::SubstrateError;
pub use executor::{
    AgentInvoker, IterativePipelineExecutor, OutputValidator, PipelineOutcome, PipelineSpec,
    PipelineStage, RestartPolicy, RestartRequest, RestartResponse, StructuralOutputValidator,
};
pub use interrupt::{InterruptChannel, InterruptPriority, InterruptSignal};
pub use policy::{AutoPromoteSettings, Policy, PolicyManager, PolicyTier};
pub use queue::{EnqueueRequest, MessagePriority, MessageQueue, MessageStatus, QueueMessage};
pub use reference_store::{
    content_id, open as open_reference_store, BackendKind, InMemoryReferenceStore, Reference,
    ReferenceStats, ReferenceStore, ReferenceType, SqliteReferenceStore, StoreOptions,
};
pub use shared_memory::{
    DeleteRequest, DeleteResponse, GetRequest, ListRequest, Namespace, NamespaceStats, PutRequest,
    PutResponse, SharedMemoryStore, StoredValue, WatchRequest,
};
