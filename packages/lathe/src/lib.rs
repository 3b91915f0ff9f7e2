//! Lathe: the job lifecycle engine for a multi-tenant CAM platform.
//!
//! The engine owns intake with idempotent admission, priority-aware routing,
//! confirmed publishing, cooperative worker execution with progress and
//! cancellation, retry/DLQ handling, operator replay and a hash-chained audit
//! log covering every state transition.
//!
//! # Architecture
//!
//! ```text
//! SubmitJob
//!     │  validate + rate limit
//!     ├─► JobStore.admit (idempotency claim + pending row, one transaction)
//!     ├─► AuditChain.append("created")
//!     └─► Publisher: confirm-awaited publish ──► pending -> queued
//!
//! WorkerRuntime (slot per kind, prefetch 1)
//!     ├─► claim: queued -> running (optimistic version)
//!     ├─► JobHandler.run(ctx)   // checkpoints + throttled progress
//!     ├─► succeeded / cancelled / timeout
//!     └─► failure ──► retry with backoff+jitter, or DLX -> DLQ
//!
//! Admin replay: DLQ -> primary (confirm before ack), audited
//! ```
//!
//! Collaborators (persistence, broker, cache, object storage, identity) sit
//! behind narrow traits; `lathe-postgres` and `lathe-amqp` provide the
//! production implementations, [`testing`] the in-memory ones.
//!
//! # Construction
//!
//! There is no global state: build one [`Engine`] from its dependencies and
//! pass it explicitly.
//!
//! ```ignore
//! let engine = Engine::new(deps, RoutingTable::standard(), EngineConfig::from_env()?)?;
//! engine.ensure_topology().await?;
//! let outcome = engine.submit_job(&actor, request).await?;
//! ```

pub mod artefact;
pub mod audit;
pub mod broker;
pub mod cancel;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod identity;
pub mod ids;
pub mod intake;
pub mod job;
pub mod observability;
pub mod progress;
pub mod publisher;
pub mod rate_limit;
pub mod replay;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod store;
pub mod topology;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod scenario_tests;

pub use artefact::{ArtefactRef, ObjectStore};
pub use audit::{
    AuditChain, AuditEvent, AuditScope, AuditStore, ChainVerification, GENESIS_PREV_HASH,
};
pub use broker::{AckHandle, Broker, Publication, PublishReceipt, TaskDelivery, TaskSource};
pub use cancel::{Cache, CancelOutcome, CancellationRecord};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Engine, EngineDeps, RetentionReport};
pub use envelope::{TaskEnvelope, TaskParams, MAX_ENVELOPE_BYTES, MAX_PARAMS_BYTES};
pub use error::{ConflictKind, EngineError, ErrorClass, Subsystem};
pub use handler::{HandlerError, HandlerRegistry, JobHandler, JobOutput, TaskContext};
pub use identity::{ActorAssertion, Identity, SecondFactor, SecondFactorMethod, StaticIdentity};
pub use intake::{SubmitOutcome, SubmitRequest};
pub use job::{Job, JobError, JobId, JobKind, JobProgress, JobStatus, OwnerId};
pub use progress::ProgressOutcome;
pub use replay::{DlqMessageSummary, ReplayFilter, ReplayReport};
pub use retry::RetryDecision;
pub use routing::{KindPolicy, RoutingTable, JOBS_EXCHANGE};
pub use scheduler::{JobStatusView, ProgressView};
pub use store::{Admission, IdempotencyRecord, JobStore, NewJob};
pub use topology::{Topology, TopologyConfig};
pub use worker::{WorkerConfig, WorkerRuntime};
