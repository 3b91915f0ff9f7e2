//! Confirmed publish of task envelopes.
//!
//! The confirm is awaited before any state update so `queued` always implies
//! broker-accepted. Transient broker failures retry with full-jitter backoff;
//! exhaustion moves the job to `failed(PUBLISH_FAILED)` and surfaces a
//! transient error to the caller.

use serde_json::json;
use tracing::{info, warn};

use crate::audit::event_types;
use crate::broker::Publication;
use crate::engine::Engine;
use crate::envelope::TaskEnvelope;
use crate::error::{ConflictKind, EngineError};
use crate::job::{Job, JobError, JobStatus};
use crate::retry::publish_backoff;
use crate::routing::{queue_name, routing_key, JOBS_EXCHANGE};

impl Engine {
    /// Publish a freshly admitted `pending` job. Observes a cancel request
    /// that raced admission: such jobs transition straight to `cancelled`
    /// without ever reaching the broker.
    pub(crate) async fn publish_admitted(
        &self,
        job: &mut Job,
        actor: Option<String>,
    ) -> Result<(), EngineError> {
        if job.cancel_requested {
            let payload = self.audit_payload_for(job, json!({"reason": "cancelled before publish"}));
            self.transition_with_audit(
                job,
                JobStatus::Cancelled,
                event_types::CANCELLED,
                payload,
                actor,
            )
            .await?;
            return Ok(());
        }
        self.publish_with_confirm(job, job.attempts + 1, actor).await
    }

    /// Publish the dispatch envelope for `job` and flip it to `queued` once
    /// the broker confirms. `attempt` is the 1-based dispatch number carried
    /// on the wire.
    pub(crate) async fn publish_with_confirm(
        &self,
        job: &mut Job,
        attempt: i32,
        actor: Option<String>,
    ) -> Result<(), EngineError> {
        let envelope = TaskEnvelope::for_job(job, attempt)?;
        let bytes = envelope.to_canonical_bytes()?;
        let publication = Publication::new(JOBS_EXCHANGE, routing_key(job.kind), bytes)
            .with_priority(job.priority.clamp(0, 10) as u8);

        let max_attempts = self.config().publish_max_attempts;
        let base = self.config().publish_base_backoff_ms;
        let cap = self.config().publish_cap_backoff_ms;
        let mut last_err = EngineError::broker("publish never attempted");

        for publish_attempt in 1..=max_attempts {
            match self.broker().publish(publication.clone()).await {
                Ok(receipt) => {
                    job.task_id = Some(receipt.task_id.clone());
                    let payload = self.audit_payload_for(
                        job,
                        json!({
                            "task_id": receipt.task_id,
                            "queue": queue_name(job.kind),
                            "dispatch_attempt": attempt,
                        }),
                    );
                    self.queued_transition(job, payload, actor).await?;
                    metrics::counter!("lathe_publish_confirmed_total", "kind" => job.kind.as_str())
                        .increment(1);
                    info!(
                        job_id = job.id,
                        task_id = %job.task_id.as_deref().unwrap_or(""),
                        queue = %queue_name(job.kind),
                        "publish confirmed"
                    );
                    return Ok(());
                }
                Err(err @ EngineError::Transient { .. }) => {
                    metrics::counter!("lathe_publish_retries_total", "kind" => job.kind.as_str())
                        .increment(1);
                    let delay = publish_backoff(publish_attempt, base, cap);
                    warn!(
                        job_id = job.id,
                        publish_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "publish not confirmed, backing off"
                    );
                    last_err = err;
                    if publish_attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        // Confirm retries exhausted: record the failure on the job. A row
        // already in `failed` (the republish path) keeps its status; the
        // caller classifies the exhaustion and settles the disposition.
        job.error = Some(JobError::publish_failed());
        if job.status.can_transition_to(JobStatus::Failed) {
            let payload = self.audit_payload_for(
                job,
                json!({"code": "PUBLISH_FAILED", "retryable": true}),
            );
            self.transition_with_audit(job, JobStatus::Failed, event_types::FAILED, payload, actor)
                .await?;
        } else {
            *job = self.store().update(job).await?;
        }
        metrics::counter!("lathe_publish_failed_total", "kind" => job.kind.as_str()).increment(1);
        Err(last_err)
    }

    /// `-> queued` transition with one reload on a version race. A concurrent
    /// writer (a cancel request updating the row) must not strand a job that
    /// the broker already accepted.
    async fn queued_transition(
        &self,
        job: &mut Job,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> Result<(), EngineError> {
        let task_id = job.task_id.clone();
        match self
            .transition_with_audit(job, JobStatus::Queued, event_types::QUEUED, payload.clone(), actor.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineError::Conflict(ConflictKind::Version)) => {
                let mut fresh = self.load_job(job.id).await?;
                fresh.task_id = task_id;
                self.transition_with_audit(
                    &mut fresh,
                    JobStatus::Queued,
                    event_types::QUEUED,
                    payload,
                    actor,
                )
                .await?;
                *job = fresh;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
