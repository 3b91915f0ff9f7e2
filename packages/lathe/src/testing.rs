//! In-memory collaborators for tests and local development.
//!
//! Every production trait has a deterministic memory implementation here:
//! job/idempotency store, audit store, broker (with priority ordering and
//! DLX routing), cache and object store. Failure-injection knobs simulate
//! broker nacks, delayed confirms and cache outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::artefact::ObjectStore;
use crate::audit::{AuditAppendError, AuditEvent, AuditScope, AuditStore, ChainHead};
use crate::broker::{
    AckHandle, Broker, Publication, PublishReceipt, TaskDelivery, TaskSource,
};
use crate::cancel::Cache;
use crate::clock::{Clock, ManualClock, SharedClock};
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineDeps};
use crate::error::{ConflictKind, EngineError, Subsystem};
use crate::identity::StaticIdentity;
use crate::job::{Job, JobId, JobStatus, OwnerId};
use crate::routing::RoutingTable;
use crate::store::{Admission, IdempotencyRecord, JobStore, NewJob};
use crate::topology::{ArgValue, BindingSpec, Topology};

/// Operator id wired into the test identity.
pub const TEST_OPERATOR: OwnerId = 99;

// ============================================================================
// Job store
// ============================================================================

#[derive(Default)]
struct JobStoreState {
    jobs: HashMap<JobId, Job>,
    idempotency: HashMap<(OwnerId, String), IdempotencyRecord>,
    next_id: JobId,
}

/// Mutex-backed job store with the same claim/optimistic-update semantics as
/// the PostgreSQL implementation.
pub struct MemoryJobStore {
    state: Mutex<JobStoreState>,
    fail_admits: AtomicU32,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JobStoreState {
                next_id: 1,
                ..Default::default()
            }),
            fail_admits: AtomicU32::new(0),
        }
    }

    /// Make the next `n` admissions fail with a transient store error.
    pub fn fail_next_admits(&self, n: u32) {
        self.fail_admits.store(n, Ordering::SeqCst);
    }

    /// Snapshot one job (test assertions).
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.state.lock().expect("job store lock").jobs.get(&id).cloned()
    }

    /// Number of stored job rows.
    pub fn job_count(&self) -> usize {
        self.state.lock().expect("job store lock").jobs.len()
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_admits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn admit(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Admission, EngineError> {
        if self.take_injected_failure() {
            return Err(EngineError::store("injected admission failure"));
        }
        let mut state = self.state.lock().expect("job store lock");
        let claim_key = (new_job.owner, new_job.idempotency_key.clone());

        if let Some(record) = state.idempotency.get(&claim_key).cloned() {
            if record.fingerprint != new_job.fingerprint {
                return Err(EngineError::Conflict(ConflictKind::Idempotency));
            }
            if let Some(job) = state.jobs.get(&record.job_id) {
                return Ok(Admission::Duplicate(job.clone()));
            }
            // Record survived retention of its job; fall through and recreate.
        }

        let id = state.next_id;
        state.next_id += 1;
        let job = Job::builder()
            .id(id)
            .owner(new_job.owner)
            .kind(new_job.kind)
            .params(new_job.params)
            .idempotency_key(new_job.idempotency_key.clone())
            .priority(new_job.priority)
            .max_retries(new_job.max_retries)
            .trace_id(new_job.trace_id)
            .created_at(now)
            .updated_at(now)
            .build();
        state.jobs.insert(id, job.clone());
        state.idempotency.insert(
            claim_key,
            IdempotencyRecord {
                owner: new_job.owner,
                key: new_job.idempotency_key,
                fingerprint: new_job.fingerprint,
                job_id: id,
                created_at: now,
            },
        );
        Ok(Admission::Created(job))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.state.lock().expect("job store lock").jobs.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<Job, EngineError> {
        let mut state = self.state.lock().expect("job store lock");
        let stored = state.jobs.get_mut(&job.id).ok_or(EngineError::NotFound {
            entity: "job",
            id: job.id.to_string(),
        })?;
        if stored.version != job.version {
            return Err(EngineError::Conflict(ConflictKind::Version));
        }
        let mut updated = job.clone();
        updated.version += 1;
        // The cancel flag is monotonic even against stale writers.
        updated.cancel_requested = updated.cancel_requested || stored.cancel_requested;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn request_cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let mut state = self.state.lock().expect("job store lock");
        let stored = state.jobs.get_mut(&id).ok_or(EngineError::NotFound {
            entity: "job",
            id: id.to_string(),
        })?;
        if stored.cancel_requested {
            return Ok(false);
        }
        stored.cancel_requested = true;
        stored.updated_at = now;
        stored.version += 1;
        Ok(true)
    }

    async fn queued_ahead(&self, job: &Job) -> Result<u64, EngineError> {
        let state = self.state.lock().expect("job store lock");
        let anchor = (job.priority, job.enqueued_at.unwrap_or(job.created_at), job.id);
        let ahead = state
            .jobs
            .values()
            .filter(|other| {
                other.kind == job.kind && other.status == JobStatus::Queued && other.id != job.id
            })
            .filter(|other| {
                let key = (
                    other.priority,
                    other.enqueued_at.unwrap_or(other.created_at),
                    other.id,
                );
                // Higher priority first, then earlier enqueue, then lower id.
                key.0 > anchor.0
                    || (key.0 == anchor.0 && key.1 < anchor.1)
                    || (key.0 == anchor.0 && key.1 == anchor.1 && key.2 < anchor.2)
            })
            .count();
        Ok(ahead as u64)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let mut state = self.state.lock().expect("job store lock");
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn expire_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let mut state = self.state.lock().expect("job store lock");
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| record.created_at >= cutoff);
        Ok((before - state.idempotency.len()) as u64)
    }
}

// ============================================================================
// Audit store
// ============================================================================

/// Mutex-backed audit store with `(scope, seq)` uniqueness and tamper helpers
/// for verifier tests.
#[derive(Default)]
pub struct MemoryAuditStore {
    chains: Mutex<HashMap<String, Vec<AuditEvent>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate one stored event in place, bypassing every integrity check.
    /// Returns `false` when the index does not exist.
    pub fn tamper(&self, scope: &AuditScope, index: usize, mutate: impl FnOnce(&mut AuditEvent)) -> bool {
        let mut chains = self.chains.lock().expect("audit lock");
        match chains.get_mut(&scope.to_string()).and_then(|c| c.get_mut(index)) {
            Some(event) => {
                mutate(event);
                true
            }
            None => false,
        }
    }

    /// Append a pre-built event without sequence or hash checks.
    pub fn insert_forged(&self, event: AuditEvent) {
        let mut chains = self.chains.lock().expect("audit lock");
        chains
            .entry(event.scope.to_string())
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn head(&self, scope: &AuditScope) -> Result<Option<ChainHead>, EngineError> {
        let chains = self.chains.lock().expect("audit lock");
        Ok(chains.get(&scope.to_string()).and_then(|events| {
            events.last().map(|event| ChainHead {
                seq: event.seq,
                chain_hash: event.chain_hash.clone(),
            })
        }))
    }

    async fn insert(&self, event: &AuditEvent) -> Result<(), AuditAppendError> {
        let mut chains = self.chains.lock().expect("audit lock");
        let chain = chains.entry(event.scope.to_string()).or_default();
        if chain.iter().any(|existing| existing.seq == event.seq) {
            return Err(AuditAppendError::SequenceConflict);
        }
        chain.push(event.clone());
        chain.sort_by_key(|e| e.seq);
        Ok(())
    }

    async fn list(&self, scope: &AuditScope) -> Result<Vec<AuditEvent>, EngineError> {
        let chains = self.chains.lock().expect("audit lock");
        Ok(chains.get(&scope.to_string()).cloned().unwrap_or_default())
    }
}

// ============================================================================
// Cache
// ============================================================================

/// TTL cache driven by the engine clock, with read-failure injection.
pub struct MemoryCache {
    clock: SharedClock,
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    fail_reads: AtomicU32,
}

impl MemoryCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            fail_reads: AtomicU32::new(0),
        }
    }

    /// Make the next `n` reads fail with a transient cache error.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("cache lock").contains_key(key)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        if self
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::Transient {
                subsystem: Subsystem::Cache,
                message: "injected cache outage".to_string(),
            });
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(key) {
            Some((value, expires)) if *expires > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError> {
        let expires = self.clock.now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        self.entries
            .lock()
            .expect("cache lock")
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), EngineError> {
        self.entries.lock().expect("cache lock").remove(key);
        Ok(())
    }
}

// ============================================================================
// Object store
// ============================================================================

/// Object store returning synthetic presigned URLs.
#[derive(Default)]
pub struct MemoryObjectStore {
    hashes: Mutex<HashMap<(String, String), String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_hash(&self, bucket: &str, key: &str, sha256_hex: &str) {
        self.hashes
            .lock()
            .expect("object store lock")
            .insert((bucket.to_string(), key.to_string()), sha256_hex.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, EngineError> {
        Ok(format!(
            "memory://{bucket}/{key}?op=get&expires={}",
            expires_in.as_secs()
        ))
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, EngineError> {
        Ok(format!(
            "memory://{bucket}/{key}?op=put&expires={}",
            expires_in.as_secs()
        ))
    }

    async fn verify_sha256(
        &self,
        bucket: &str,
        key: &str,
        expected_hex: &str,
    ) -> Result<bool, EngineError> {
        let hashes = self.hashes.lock().expect("object store lock");
        Ok(hashes
            .get(&(bucket.to_string(), key.to_string()))
            .map(|stored| stored == expected_hex)
            .unwrap_or(false))
    }
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    payload: Vec<u8>,
    routing_key: String,
    headers: BTreeMap<String, String>,
    priority: u8,
    redelivered: bool,
    seq: u64,
}

struct MemoryQueue {
    ready: Vec<StoredMessage>,
    args: HashMap<String, ArgValue>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Vec<BindingSpec>>,
    queues: HashMap<String, MemoryQueue>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    seq: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    fail_publishes: AtomicU32,
    confirm_delay_ms: AtomicU64,
    next_tag: AtomicU64,
}

/// In-memory broker: direct-exchange routing, per-queue priority ordering,
/// DLX routing on reject, confirm delay and nack injection.
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                fail_publishes: AtomicU32::new(0),
                confirm_delay_ms: AtomicU64::new(0),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Nack the next `n` publishes.
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Delay every confirm by `delay`.
    pub fn set_confirm_delay(&self, delay: Duration) {
        self.inner
            .confirm_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn clear_confirm_delay(&self) {
        self.inner.confirm_delay_ms.store(0, Ordering::SeqCst);
    }

    /// Ready depth of a queue (test assertions).
    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .expect("broker lock")
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    fn pop(inner: &Arc<BrokerInner>, queue: &str) -> Option<TaskDelivery> {
        let mut state = inner.state.lock().expect("broker lock");
        let ready = &mut state.queues.get_mut(queue)?.ready;
        if ready.is_empty() {
            return None;
        }
        let message = ready.remove(0);
        let tag = inner.next_tag.fetch_add(1, Ordering::SeqCst);
        state
            .unacked
            .insert(tag, (queue.to_string(), message.clone()));
        Some(TaskDelivery {
            payload: message.payload.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            headers: message.headers.clone(),
            message_id: Some(message.message_id),
            acker: Box::new(MemoryAcker {
                inner: inner.clone(),
                tag,
            }),
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn enqueue(state: &mut BrokerState, queue: &str, message: StoredMessage) {
    if let Some(q) = state.queues.get_mut(queue) {
        q.ready.push(message);
        // Dispatch order: priority strictly precedes arrival.
        q.ready
            .sort_by_key(|m| (std::cmp::Reverse(m.priority), m.seq));
    }
}

/// Route a message through an exchange to every bound queue. Returns how many
/// queues accepted it.
fn route(state: &mut BrokerState, exchange: &str, routing_key: &str, message: StoredMessage) -> usize {
    let bindings: Vec<BindingSpec> = match state.exchanges.get(exchange) {
        Some(bindings) => bindings
            .iter()
            .filter(|b| b.routing_key == "#" || b.routing_key == routing_key)
            .cloned()
            .collect(),
        None => Vec::new(),
    };
    let mut delivered = 0;
    for binding in bindings {
        enqueue(state, &binding.queue, message.clone());
        delivered += 1;
    }
    delivered
}

struct MemoryAcker {
    inner: Arc<BrokerInner>,
    tag: u64,
}

#[async_trait]
impl AckHandle for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), EngineError> {
        self.inner
            .state
            .lock()
            .expect("broker lock")
            .unacked
            .remove(&self.tag);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().expect("broker lock");
        if let Some((queue, mut message)) = state.unacked.remove(&self.tag) {
            if requeue {
                message.redelivered = true;
                enqueue(&mut state, &queue, message);
            } else {
                // Dead-letter through the queue's configured DLX.
                let dlx = state.queues.get(&queue).and_then(|q| {
                    match q.args.get("x-dead-letter-exchange") {
                        Some(ArgValue::Str(name)) => Some(name.clone()),
                        _ => None,
                    }
                });
                let dl_key = state
                    .queues
                    .get(&queue)
                    .and_then(|q| match q.args.get("x-dead-letter-routing-key") {
                        Some(ArgValue::Str(key)) => Some(key.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| message.routing_key.clone());
                if let Some(dlx) = dlx {
                    route(&mut state, &dlx, &dl_key, message);
                }
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryTaskSource {
    inner: Arc<BrokerInner>,
    queue: String,
}

#[async_trait]
impl TaskSource for MemoryTaskSource {
    async fn next(&mut self) -> Result<Option<TaskDelivery>, EngineError> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(delivery) = InMemoryBroker::pop(&self.inner, &self.queue) {
                return Ok(Some(delivery));
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().expect("broker lock");
        for exchange in &topology.exchanges {
            state.exchanges.entry(exchange.name.clone()).or_default();
        }
        for queue in &topology.queues {
            let args: HashMap<String, ArgValue> = queue.args.iter().cloned().collect();
            state
                .queues
                .entry(queue.name.clone())
                .and_modify(|existing| existing.args = args.clone())
                .or_insert(MemoryQueue {
                    ready: Vec::new(),
                    args,
                });
        }
        for binding in &topology.bindings {
            let bindings = state.exchanges.entry(binding.exchange.clone()).or_default();
            if !bindings.contains(binding) {
                bindings.push(binding.clone());
            }
        }
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<PublishReceipt, EngineError> {
        if self
            .inner
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::broker("publish nacked (injected)"));
        }
        let delay = self.inner.confirm_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.inner.state.lock().expect("broker lock");
        if !state.exchanges.contains_key(&publication.exchange) {
            return Err(EngineError::broker(format!(
                "unknown exchange {}",
                publication.exchange
            )));
        }
        state.seq += 1;
        let message = StoredMessage {
            message_id: publication.message_id.clone(),
            payload: publication.payload,
            routing_key: publication.routing_key.clone(),
            headers: publication.headers,
            priority: publication.priority,
            redelivered: false,
            seq: state.seq,
        };
        let delivered = route(
            &mut state,
            &publication.exchange,
            &publication.routing_key,
            message,
        );
        drop(state);

        if delivered == 0 && publication.mandatory {
            return Err(EngineError::broker(format!(
                "unroutable message for key {}",
                publication.routing_key
            )));
        }
        self.inner.notify.notify_waiters();
        Ok(PublishReceipt {
            task_id: publication.message_id,
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        _prefetch: u16,
    ) -> Result<Box<dyn TaskSource>, EngineError> {
        Ok(Box::new(MemoryTaskSource {
            inner: self.inner.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn get(&self, queue: &str) -> Result<Option<TaskDelivery>, EngineError> {
        Ok(InMemoryBroker::pop(&self.inner, queue))
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, EngineError> {
        Ok(self.depth(queue) as u64)
    }

    async fn purge(&self, queue: &str) -> Result<u64, EngineError> {
        let mut state = self.inner.state.lock().expect("broker lock");
        match state.queues.get_mut(queue) {
            Some(q) => {
                let purged = q.ready.len() as u64;
                q.ready.clear();
                Ok(purged)
            }
            None => Ok(0),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Fully wired engine over the memory collaborators.
pub struct TestHarness {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryJobStore>,
    pub audit: Arc<MemoryAuditStore>,
    pub broker: Arc<InMemoryBroker>,
    pub cache: Arc<MemoryCache>,
}

/// Build an engine over memory collaborators and reconcile its topology.
pub async fn harness() -> TestHarness {
    harness_with_config(EngineConfig {
        per_owner_rps: 1_000,
        global_rps: 10_000,
        ..EngineConfig::default()
    })
    .await
}

pub async fn harness_with_config(config: EngineConfig) -> TestHarness {
    harness_full(config, RoutingTable::standard()).await
}

/// Harness with a custom routing table (shortened budgets, retry tweaks).
pub async fn harness_with_routing(routing: RoutingTable) -> TestHarness {
    harness_full(
        EngineConfig {
            per_owner_rps: 1_000,
            global_rps: 10_000,
            ..EngineConfig::default()
        },
        routing,
    )
    .await
}

pub async fn harness_full(config: EngineConfig, routing: RoutingTable) -> TestHarness {
    let clock = Arc::new(ManualClock::fixed());
    let shared_clock: SharedClock = clock.clone();
    let store = Arc::new(MemoryJobStore::new());
    let audit = Arc::new(MemoryAuditStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let cache = Arc::new(MemoryCache::new(shared_clock.clone()));
    let identity = Arc::new(StaticIdentity::new([TEST_OPERATOR], shared_clock));
    let object_store = Arc::new(MemoryObjectStore::new());

    let engine = Engine::new(
        EngineDeps {
            clock: clock.clone(),
            store: store.clone(),
            audit_store: audit.clone(),
            broker: broker.clone(),
            cache: cache.clone(),
            identity,
            object_store,
        },
        routing,
        config,
    )
    .expect("test engine construction");
    engine.ensure_topology().await.expect("topology declaration");

    TestHarness {
        engine,
        clock,
        store,
        audit,
        broker,
        cache,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use crate::routing::{dlq_name, queue_name, routing_key, JOBS_EXCHANGE};
    use serde_json::json;

    fn new_job(owner: OwnerId, key: &str, fingerprint: &str) -> NewJob {
        NewJob {
            owner,
            kind: JobKind::Model,
            params: json!({"l": 10}),
            idempotency_key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            priority: 5,
            max_retries: 3,
            trace_id: "t".repeat(32),
        }
    }

    #[tokio::test]
    async fn admit_claims_once_and_returns_duplicates() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let first = store.admit(new_job(42, "abc", "f1"), now).await.unwrap();
        assert!(first.is_created());

        let second = store.admit(new_job(42, "abc", "f1"), now).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.job().id, first.job().id);
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn admit_rejects_fingerprint_mismatch() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.admit(new_job(42, "abc", "f1"), now).await.unwrap();

        let err = store.admit(new_job(42, "abc", "f2"), now).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Conflict(ConflictKind::Idempotency)
        ));
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn same_key_different_owner_is_a_separate_claim() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.admit(new_job(42, "abc", "f1"), now).await.unwrap();
        let other = store.admit(new_job(43, "abc", "f1"), now).await.unwrap();
        assert!(other.is_created());
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn update_enforces_optimistic_versioning() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let admitted = store.admit(new_job(42, "abc", "f1"), now).await.unwrap();
        let mut job = admitted.job().clone();

        let stored = store.update(&job).await.unwrap();
        assert_eq!(stored.version, job.version + 1);

        // Stale writer loses.
        job.priority = 9;
        assert!(matches!(
            store.update(&job).await,
            Err(EngineError::Conflict(ConflictKind::Version))
        ));
    }

    #[tokio::test]
    async fn request_cancel_is_monotonic_at_the_store() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let admitted = store.admit(new_job(42, "abc", "f1"), now).await.unwrap();
        let id = admitted.job().id;

        assert!(store.request_cancel(id, now).await.unwrap());
        assert!(!store.request_cancel(id, now).await.unwrap());
        assert!(store.job(id).unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn memory_broker_orders_by_priority_then_fifo() {
        let broker = InMemoryBroker::new();
        let topology = Topology::standard(
            &RoutingTable::standard(),
            &crate::topology::TopologyConfig::default(),
        );
        broker.declare(&topology).await.unwrap();

        for (priority, tag) in [(5u8, "a"), (9, "b"), (5, "c"), (9, "d"), (0, "e")] {
            broker
                .publish(
                    Publication::new(JOBS_EXCHANGE, routing_key(JobKind::Model), tag.into())
                        .with_priority(priority),
                )
                .await
                .unwrap();
        }

        let mut order = Vec::new();
        while let Some(delivery) = broker.get(&queue_name(JobKind::Model)).await.unwrap() {
            order.push(String::from_utf8(delivery.payload.clone()).unwrap());
            delivery.acker.ack().await.unwrap();
        }
        assert_eq!(order, vec!["b", "d", "a", "c", "e"]);
    }

    #[tokio::test]
    async fn memory_broker_nack_routes_to_the_dlq() {
        let broker = InMemoryBroker::new();
        let topology = Topology::standard(
            &RoutingTable::standard(),
            &crate::topology::TopologyConfig::default(),
        );
        broker.declare(&topology).await.unwrap();

        broker
            .publish(Publication::new(
                JOBS_EXCHANGE,
                routing_key(JobKind::Cam),
                b"payload".to_vec(),
            ))
            .await
            .unwrap();

        let delivery = broker.get(&queue_name(JobKind::Cam)).await.unwrap().unwrap();
        delivery.acker.nack(false).await.unwrap();

        assert_eq!(broker.depth(&queue_name(JobKind::Cam)), 0);
        assert_eq!(broker.depth(&dlq_name(JobKind::Cam)), 1);
    }

    #[tokio::test]
    async fn memory_broker_requeue_preserves_the_message() {
        let broker = InMemoryBroker::new();
        let topology = Topology::standard(
            &RoutingTable::standard(),
            &crate::topology::TopologyConfig::default(),
        );
        broker.declare(&topology).await.unwrap();

        broker
            .publish(Publication::new(
                JOBS_EXCHANGE,
                routing_key(JobKind::Sim),
                b"again".to_vec(),
            ))
            .await
            .unwrap();

        let delivery = broker.get(&queue_name(JobKind::Sim)).await.unwrap().unwrap();
        delivery.acker.nack(true).await.unwrap();

        let redelivered = broker.get(&queue_name(JobKind::Sim)).await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.payload, b"again");
        redelivered.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn unroutable_mandatory_publish_fails() {
        let broker = InMemoryBroker::new();
        let topology = Topology::standard(
            &RoutingTable::standard(),
            &crate::topology::TopologyConfig::default(),
        );
        broker.declare(&topology).await.unwrap();

        let err = broker
            .publish(Publication::new(JOBS_EXCHANGE, "jobs.nope", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transient { .. }));
    }

    #[tokio::test]
    async fn cache_honours_ttl_through_the_clock() {
        let clock = Arc::new(ManualClock::fixed());
        let cache = MemoryCache::new(clock.clone());

        cache
            .set("cancel:1", "x", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(cache.get("cancel:1").await.unwrap(), Some("x".to_string()));

        clock.advance(chrono::Duration::milliseconds(501));
        assert_eq!(cache.get("cancel:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_read_failure_injection_is_one_shot_each() {
        let clock = Arc::new(ManualClock::fixed());
        let cache = MemoryCache::new(clock);
        cache.fail_next_reads(1);
        assert!(cache.get("k").await.is_err());
        assert!(cache.get("k").await.is_ok());
    }
}
