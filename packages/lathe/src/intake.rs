//! Intake: validated, rate-limited, idempotent job admission.

use serde_json::json;
use tracing::{debug, info};

use crate::audit::{event_types, AuditScope};
use crate::canonical::{canonical_string, fingerprint};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::identity::ActorAssertion;
use crate::job::{normalize_idempotency_key, validate_priority, JobId, JobStatus};
use crate::routing::queue_name;
use crate::store::{Admission, NewJob};

/// Transport-agnostic submission request. The owner is the authenticated
/// actor; kinds arrive as raw strings and are validated against the routing
/// table.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: String,
    pub params: serde_json::Value,
    pub idempotency_key: String,
    pub priority: Option<i16>,
    pub trace_id: Option<String>,
}

/// Result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    /// `false` on an idempotent duplicate hit.
    pub created: bool,
    pub status: JobStatus,
    pub queue: String,
}

impl Engine {
    /// Submit a job: validate, claim idempotency, create the row in
    /// `pending`, audit `created`, then publish with confirm which flips it
    /// to `queued`.
    ///
    /// Duplicate submissions with a matching fingerprint return the original
    /// job with `created = false`. A matching key with different params fails
    /// with an idempotency conflict and creates nothing.
    pub async fn submit_job(
        &self,
        actor: &ActorAssertion,
        request: SubmitRequest,
    ) -> Result<SubmitOutcome, EngineError> {
        let owner = actor.actor_id;
        self.limiter().check(owner)?;

        let kind = self.routing().parse_kind(&request.kind)?;
        if !request.params.is_object() {
            return Err(EngineError::validation("params must be a JSON object"));
        }
        let canonical_params = canonical_string(&request.params);
        if canonical_params.len() > self.config().max_params_bytes {
            return Err(EngineError::PayloadTooLarge {
                size: canonical_params.len(),
                limit: self.config().max_params_bytes,
            });
        }
        let idempotency_key = normalize_idempotency_key(&request.idempotency_key)?;
        let policy = self.policy(kind);
        let priority = validate_priority(request.priority, policy.default_priority)?;
        let max_retries = policy.max_retries;
        let request_fingerprint = fingerprint(&request.params, kind, owner);
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(crate::ids::new_trace_id);

        let new_job = NewJob {
            owner,
            kind,
            params: request.params,
            idempotency_key,
            fingerprint: request_fingerprint.clone(),
            priority,
            max_retries,
            trace_id: trace_id.clone(),
        };

        let admission = self.admit_with_retry(new_job).await?;
        let queue = queue_name(kind);

        match admission {
            Admission::Duplicate(job) => {
                debug!(
                    job_id = job.id,
                    owner,
                    kind = %kind,
                    "idempotent duplicate submission"
                );
                metrics::counter!("lathe_jobs_submitted_total", "kind" => kind.as_str(), "outcome" => "duplicate")
                    .increment(1);
                Ok(SubmitOutcome {
                    job_id: job.id,
                    created: false,
                    status: job.status,
                    queue,
                })
            }
            Admission::Created(mut job) => {
                self.audit()
                    .append(
                        AuditScope::job(job.id),
                        event_types::CREATED,
                        json!({
                            "job_kind": kind.as_str(),
                            "priority": priority,
                            "owner": owner,
                            "fingerprint": request_fingerprint,
                            "trace_id": trace_id,
                        }),
                        Some(actor.audit_actor()),
                    )
                    .await?;

                info!(
                    job_id = job.id,
                    owner,
                    kind = %kind,
                    priority,
                    trace_id = %trace_id,
                    "job admitted"
                );
                metrics::counter!("lathe_jobs_submitted_total", "kind" => kind.as_str(), "outcome" => "created")
                    .increment(1);

                self.publish_admitted(&mut job, Some(actor.audit_actor()))
                    .await?;

                Ok(SubmitOutcome {
                    job_id: job.id,
                    created: true,
                    status: job.status,
                    queue,
                })
            }
        }
    }

    /// Admission with a short local retry for transient store failures.
    async fn admit_with_retry(&self, new_job: NewJob) -> Result<Admission, EngineError> {
        let mut last_err = None;
        for attempt in 1..=3_u32 {
            let now = self.clock().now();
            match self.store().admit(new_job.clone(), now).await {
                Ok(admission) => return Ok(admission),
                Err(err @ EngineError::Transient { .. }) => {
                    debug!(attempt, error = %err, "transient admission failure, retrying");
                    tokio::time::sleep(crate::retry::publish_backoff(attempt, 50, 500)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::store("admission retries exhausted")))
    }
}
