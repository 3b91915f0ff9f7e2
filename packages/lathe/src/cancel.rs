//! Idempotent cancellation with a distributed cancel-flag cache.
//!
//! The job store flag is authoritative; the cache only shortens the path for
//! worker checkpoints. Cache failures degrade to the store and never raise.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{event_types, AuditScope};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::identity::ActorAssertion;
use crate::job::JobId;

/// Cache collaborator contract: best-effort, never authoritative.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), EngineError>;
    async fn del(&self, key: &str) -> Result<(), EngineError>;
}

/// Cached cancel-flag entry under `cancel:{job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub cancelled: bool,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub fn cancel_cache_key(job_id: JobId) -> String {
    format!("cancel:{job_id}")
}

/// Result of a cancel request; all paths are idempotent successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub job_id: JobId,
    pub cancel_requested: bool,
    pub already_terminal: bool,
    pub already_requested: bool,
    pub accepted: bool,
}

impl Engine {
    /// Request cancellation of a job. Never blocks on worker acknowledgement;
    /// the observable latency is the worker's next checkpoint plus cache
    /// propagation.
    pub async fn request_cancel(
        &self,
        actor: &ActorAssertion,
        job_id: JobId,
        reason: Option<String>,
    ) -> Result<CancelOutcome, EngineError> {
        let job = self.load_job(job_id).await?;
        // Callers who may not observe the job see the same 404 as a missing
        // row.
        match self.identity().authorize_owner(actor, job.owner).await {
            Ok(()) => {}
            Err(EngineError::Forbidden) => {
                return Err(EngineError::NotFound {
                    entity: "job",
                    id: job_id.to_string(),
                })
            }
            Err(err) => return Err(err),
        }

        if job.status.is_terminal() {
            return Ok(CancelOutcome {
                job_id,
                cancel_requested: job.cancel_requested,
                already_terminal: true,
                already_requested: false,
                accepted: false,
            });
        }
        if job.cancel_requested {
            return Ok(CancelOutcome {
                job_id,
                cancel_requested: true,
                already_terminal: false,
                already_requested: true,
                accepted: false,
            });
        }

        let now = self.clock().now();
        let won = self.store().request_cancel(job_id, now).await?;
        if !won {
            // A concurrent request set the flag first.
            return Ok(CancelOutcome {
                job_id,
                cancel_requested: true,
                already_terminal: false,
                already_requested: true,
                accepted: false,
            });
        }

        let record = CancellationRecord {
            cancelled: true,
            requested_at: now,
            requested_by: actor.audit_actor(),
            reason: reason.clone(),
        };
        let value = serde_json::to_string(&record).unwrap_or_default();
        if let Err(err) = self
            .cache()
            .set(
                &cancel_cache_key(job_id),
                &value,
                Duration::from_millis(self.config().cancel_cache_ttl_ms),
            )
            .await
        {
            warn!(job_id, error = %err, "cancel-flag cache write failed, store remains authoritative");
        }

        self.audit()
            .append(
                AuditScope::job(job_id),
                event_types::CANCEL_REQUESTED,
                json!({
                    "requested_by": actor.audit_actor(),
                    "reason": reason,
                }),
                Some(actor.audit_actor()),
            )
            .await?;

        metrics::counter!("lathe_cancel_requests_total").increment(1);
        info!(job_id, actor = %actor.audit_actor(), "cancellation requested");

        Ok(CancelOutcome {
            job_id,
            cancel_requested: true,
            already_terminal: false,
            already_requested: false,
            accepted: true,
        })
    }

    /// Worker checkpoint contract: cache first, store on miss. Returns `true`
    /// iff cancellation was requested. Transient cache failures fall back to
    /// the store instead of raising.
    pub async fn check_cancel(&self, job_id: JobId) -> Result<bool, EngineError> {
        match self.cache().get(&cancel_cache_key(job_id)).await {
            Ok(Some(_)) => return Ok(true),
            Ok(None) => {}
            Err(err) => {
                debug!(job_id, error = %err, "cancel cache read failed, falling back to store");
            }
        }
        Ok(self
            .store()
            .get(job_id)
            .await?
            .map(|job| job.cancel_requested)
            .unwrap_or(false))
    }
}
