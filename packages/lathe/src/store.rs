//! Persistence contracts for jobs and idempotency records.
//!
//! Implementations (PostgreSQL in `lathe-postgres`, in-memory in
//! [`crate::testing`]) provide the two concurrency primitives the engine
//! relies on: unique-constraint enforcement for the idempotency claim and
//! optimistic `(id, version)` updates for state transitions. No distributed
//! locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::job::{Job, JobId, JobKind, OwnerId};

/// Keyed record backing idempotent admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub owner: OwnerId,
    pub key: String,
    pub fingerprint: String,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to create a job row during admission.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner: OwnerId,
    pub kind: JobKind,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub fingerprint: String,
    pub priority: i16,
    pub max_retries: i32,
    pub trace_id: String,
}

/// Outcome of an atomic admission claim.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The claim was won; the job row was created in `pending`.
    Created(Job),
    /// A record with the same `(owner, key)` and fingerprint already exists.
    Duplicate(Job),
}

impl Admission {
    pub fn job(&self) -> &Job {
        match self {
            Admission::Created(job) | Admission::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

/// Persistence contract for job entities.
///
/// `admit` must be atomic: the idempotency record and the job row are written
/// in the same transaction, and a concurrent duplicate claim resolves to the
/// first writer's job. A fingerprint mismatch surfaces as
/// `EngineError::Conflict(ConflictKind::Idempotency)`.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn admit(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Admission, EngineError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, EngineError>;

    /// Persist a mutated job guarded by its optimistic version. Returns the
    /// stored row with the bumped version, or
    /// `EngineError::Conflict(ConflictKind::Version)` when the row moved.
    async fn update(&self, job: &Job) -> Result<Job, EngineError>;

    /// Atomically set `cancel_requested`. Returns `true` when this call set
    /// the flag, `false` when it was already set. `NotFound` when missing.
    async fn request_cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, EngineError>;

    /// Number of queued jobs that will be dispatched before this one:
    /// same kind, status `queued`, sorted by `(priority desc, enqueued_at,
    /// id)`.
    async fn queued_ahead(&self, job: &Job) -> Result<u64, EngineError>;

    /// Retention: delete terminal jobs finished before the cutoff.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError>;

    /// Retention: expire idempotency records created before the cutoff.
    async fn expire_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn admission_exposes_the_job_either_way() {
        let now = Utc::now();
        let job = Job::builder()
            .id(7_i64)
            .owner(42_i64)
            .kind(JobKind::Model)
            .params(json!({}))
            .idempotency_key("abc")
            .trace_id("t".repeat(32))
            .created_at(now)
            .updated_at(now)
            .build();

        let created = Admission::Created(job.clone());
        let duplicate = Admission::Duplicate(job);
        assert!(created.is_created());
        assert!(!duplicate.is_created());
        assert_eq!(created.job().id, 7);
        assert_eq!(duplicate.job().id, 7);
    }
}
