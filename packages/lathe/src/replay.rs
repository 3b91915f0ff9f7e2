//! Operator DLQ tooling: list, replay, purge.
//!
//! Replay is exactly-once per DLQ message within one operation: the message
//! is acked only after the primary publish confirms. A broker failure aborts
//! the operation and surfaces the partial count.

use serde_json::json;
use tracing::{info, warn};

use crate::audit::{event_types, AuditScope};
use crate::broker::{headers, Publication, TaskDelivery};
use crate::engine::Engine;
use crate::envelope::TaskEnvelope;
use crate::error::EngineError;
use crate::identity::ActorAssertion;
use crate::job::{JobId, JobKind, JobStatus};
use crate::routing::{dlq_name, routing_key, JOBS_EXCHANGE};

/// Browsable summary of one dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqMessageSummary {
    pub message_id: Option<String>,
    pub job_id: JobId,
    pub kind: JobKind,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub attempts_recorded: Option<String>,
    pub first_seen: Option<String>,
    pub size_bytes: usize,
}

/// Replay selection: everything up to `max_messages`, optionally narrowed to
/// one message id.
#[derive(Debug, Clone)]
pub struct ReplayFilter {
    pub message_id: Option<String>,
    pub max_messages: usize,
}

impl ReplayFilter {
    pub fn all(max_messages: usize) -> Self {
        Self {
            message_id: None,
            max_messages,
        }
    }

    pub fn single(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            max_messages: 1,
        }
    }
}

/// Outcome of a replay operation. `aborted` carries the broker error when the
/// operation stopped early; counts stay accurate either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub inspected: usize,
    pub replayed: usize,
    pub new_task_ids: Vec<String>,
    pub aborted: Option<String>,
}

impl Engine {
    /// Page through a kind's DLQ without consuming it. Messages are read and
    /// requeued; ordering is preserved.
    pub async fn list_dlq(
        &self,
        actor: &ActorAssertion,
        kind: JobKind,
        limit: usize,
    ) -> Result<Vec<DlqMessageSummary>, EngineError> {
        self.identity().authorize_operator(actor).await?;

        let queue = dlq_name(kind);
        let mut summaries = Vec::new();
        let mut held = Vec::new();

        for _ in 0..limit {
            match self.broker().get(&queue).await? {
                Some(delivery) => {
                    summaries.push(summarize(kind, &delivery));
                    held.push(delivery);
                }
                None => break,
            }
        }

        // Put everything back, newest requeue first so the original order
        // survives a head-requeue broker.
        for delivery in held.into_iter().rev() {
            if let Err(err) = delivery.acker.nack(true).await {
                warn!(queue = %queue, error = %err, "dlq browse requeue failed");
            }
        }
        Ok(summaries)
    }

    /// Replay dead-lettered messages back to the primary queue.
    pub async fn replay_dlq(
        &self,
        actor: &ActorAssertion,
        kind: JobKind,
        filter: ReplayFilter,
    ) -> Result<ReplayReport, EngineError> {
        self.identity().authorize_operator(actor).await?;

        let queue = dlq_name(kind);
        let operator = actor.audit_actor();
        let depth = self.broker().queue_depth(&queue).await? as usize;
        let max_messages = filter.max_messages.max(1);

        let mut report = ReplayReport {
            inspected: 0,
            replayed: 0,
            new_task_ids: Vec::new(),
            aborted: None,
        };

        // Bounded by the starting depth so requeued non-matches cannot loop.
        for _ in 0..depth {
            if report.replayed >= max_messages {
                break;
            }
            let delivery = match self.broker().get(&queue).await? {
                Some(delivery) => delivery,
                None => break,
            };
            report.inspected += 1;

            if let Some(wanted) = &filter.message_id {
                if delivery.message_id.as_deref() != Some(wanted.as_str()) {
                    delivery.acker.nack(true).await?;
                    continue;
                }
            }

            let envelope = match TaskEnvelope::from_bytes(&delivery.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(queue = %queue, error = %err, "unparseable dlq message left in place");
                    delivery.acker.nack(true).await?;
                    continue;
                }
            };

            match self
                .replay_one(kind, envelope, &delivery, &operator)
                .await
            {
                Ok(task_id) => {
                    delivery.acker.ack().await?;
                    report.replayed += 1;
                    report.new_task_ids.push(task_id);
                    if filter.message_id.is_some() {
                        break;
                    }
                }
                Err(err) => {
                    // Leave the message where it is and surface the partial
                    // count.
                    let _ = delivery.acker.nack(true).await;
                    warn!(queue = %queue, error = %err, "replay aborted on broker failure");
                    report.aborted = Some(err.to_string());
                    break;
                }
            }
        }

        info!(
            kind = %kind,
            inspected = report.inspected,
            replayed = report.replayed,
            aborted = report.aborted.is_some(),
            "dlq replay finished"
        );
        Ok(report)
    }

    async fn replay_one(
        &self,
        kind: JobKind,
        mut envelope: TaskEnvelope,
        delivery: &TaskDelivery,
        operator: &str,
    ) -> Result<String, EngineError> {
        // Soft attempts floor: enough headroom that the task is not dropped
        // straight back to the DLQ, without forgetting its history entirely.
        let max_retries = self.policy(kind).max_retries;
        let floor = (max_retries - 1).max(1);
        envelope.attempt = envelope.attempt.min(floor);

        let bytes = envelope.to_canonical_bytes()?;
        let publication = Publication::new(JOBS_EXCHANGE, routing_key(kind), bytes)
            .with_header(headers::REPLAYED_BY, operator.to_string());
        let receipt = self.broker().publish(publication).await?;

        self.audit()
            .append(
                AuditScope::job(envelope.job_id),
                event_types::DLQ_REPLAYED,
                json!({
                    "message_id": delivery.message_id,
                    "task_id": receipt.task_id,
                    "operator": operator,
                    "attempt_floor": envelope.attempt,
                }),
                Some(operator.to_string()),
            )
            .await?;
        metrics::counter!("lathe_dlq_replayed_total", "kind" => kind.as_str()).increment(1);

        // Re-queue the job row so a worker claim succeeds. Jobs that moved on
        // (cancelled meanwhile) keep their state; the stale task will be
        // acked without work.
        match self.store().get(envelope.job_id).await? {
            Some(mut job) if job.status == JobStatus::Failed && !job.cancel_requested => {
                job.task_id = Some(receipt.task_id.clone());
                let payload = self.audit_payload_for(
                    &job,
                    json!({"task_id": receipt.task_id, "replayed": true}),
                );
                if let Err(err) = self
                    .transition_with_audit(
                        &mut job,
                        JobStatus::Queued,
                        event_types::QUEUED,
                        payload,
                        Some(operator.to_string()),
                    )
                    .await
                {
                    warn!(job_id = envelope.job_id, error = %err, "replayed job row not requeued");
                }
            }
            Some(job) => {
                warn!(
                    job_id = job.id,
                    status = %job.status,
                    "replayed message for a job that moved on"
                );
            }
            None => {
                warn!(job_id = envelope.job_id, "replayed message for a purged job");
            }
        }

        Ok(receipt.task_id)
    }

    /// Drop every message from a kind's DLQ. Rare, audited.
    pub async fn purge_dlq(
        &self,
        actor: &ActorAssertion,
        kind: JobKind,
    ) -> Result<u64, EngineError> {
        self.identity().authorize_operator(actor).await?;
        let purged = self.broker().purge(&dlq_name(kind)).await?;
        self.audit()
            .append(
                AuditScope::queue(kind),
                event_types::DLQ_PURGED,
                json!({"queue": dlq_name(kind), "purged": purged}),
                Some(actor.audit_actor()),
            )
            .await?;
        info!(kind = %kind, purged, "dlq purged");
        Ok(purged)
    }
}

fn summarize(kind: JobKind, delivery: &TaskDelivery) -> DlqMessageSummary {
    let parsed = TaskEnvelope::from_bytes(&delivery.payload).ok();
    DlqMessageSummary {
        message_id: delivery.message_id.clone(),
        job_id: parsed.as_ref().map(|e| e.job_id).unwrap_or_default(),
        kind,
        attempt: parsed.as_ref().map(|e| e.attempt).unwrap_or_default(),
        last_error: delivery.headers.get(headers::LAST_ERROR).cloned(),
        attempts_recorded: delivery.headers.get(headers::ATTEMPTS).cloned(),
        first_seen: delivery.headers.get(headers::FIRST_SEEN).cloned(),
        size_bytes: delivery.payload.len(),
    }
}
