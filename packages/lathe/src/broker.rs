//! Message broker collaborator contract.
//!
//! The engine trusts exactly two broker primitives: publisher confirms and
//! consumer acks. Everything else (exchange types, queue arguments, delivery
//! plumbing) is declared through [`crate::topology`] and hidden behind this
//! trait. `lathe-amqp` implements it for RabbitMQ; the in-memory broker in
//! [`crate::testing`] implements it for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::topology::Topology;

/// Message headers used to enrich dead-lettered tasks.
pub mod headers {
    pub const LAST_ERROR: &str = "x-last-error";
    pub const ATTEMPTS: &str = "x-attempts";
    pub const FIRST_SEEN: &str = "x-first-seen";
    pub const REPLAYED_BY: &str = "x-replayed-by";
}

/// A publish request. Built only by the publisher and the retry/DLQ handler;
/// routing keys never derive from user input.
#[derive(Debug, Clone)]
pub struct Publication {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub priority: u8,
    pub persistent: bool,
    pub mandatory: bool,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

impl Publication {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            priority: 0,
            persistent: true,
            mandatory: true,
            message_id: crate::ids::new_message_id(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }
}

/// Broker acknowledgement of a confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Broker-assigned task handle, persisted on the job as `task_id`.
    pub task_id: String,
}

/// Manual acknowledgement handle for one delivery.
#[async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<(), EngineError>;

    /// `requeue = true` puts the message back on its queue; `false` hands it
    /// to the queue's dead-letter exchange.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), EngineError>;
}

/// One delivered message awaiting ack.
pub struct TaskDelivery {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: BTreeMap<String, String>,
    pub message_id: Option<String>,
    pub acker: Box<dyn AckHandle>,
}

impl std::fmt::Debug for TaskDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDelivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

/// Open subscription on one queue.
#[async_trait]
pub trait TaskSource: Send {
    /// Next delivery, `None` once the source is closed. Implementations block
    /// until a message arrives or the connection drops.
    async fn next(&mut self) -> Result<Option<TaskDelivery>, EngineError>;
}

/// The narrow broker contract consumed by the core.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently reconcile the declared topology. Pre-existing matching
    /// state is tolerated.
    async fn declare(&self, topology: &Topology) -> Result<(), EngineError>;

    /// Publish and wait for the broker confirm. A nack or confirm timeout is
    /// a transient broker error.
    async fn publish(&self, publication: Publication) -> Result<PublishReceipt, EngineError>;

    /// Subscribe to a queue with the given prefetch (task slots use 1).
    async fn subscribe(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn TaskSource>, EngineError>;

    /// Pull a single message without a standing subscription (DLQ browsing
    /// and replay). The message stays unacked until its handle resolves it.
    async fn get(&self, queue: &str) -> Result<Option<TaskDelivery>, EngineError>;

    /// Ready-message depth of a queue.
    async fn queue_depth(&self, queue: &str) -> Result<u64, EngineError>;

    /// Drop all ready messages from a queue, returning how many were purged.
    async fn purge(&self, queue: &str) -> Result<u64, EngineError>;
}
