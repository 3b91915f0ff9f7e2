//! Worker runtime: consume, claim, execute, settle.
//!
//! Each task slot holds a prefetch-1 subscription on one kind queue. A slot
//! runs one task to completion, suspending only at I/O and at the explicit
//! checkpoint/progress calls. The wall-clock deadline is enforced here, not
//! by the broker; broker redelivery of a task whose first claim is still
//! `running` is acked without work via the optimistic claim.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{event_types, AuditScope};
use crate::broker::{headers, Publication, TaskDelivery};
use crate::engine::Engine;
use crate::envelope::TaskEnvelope;
use crate::error::{ConflictKind, EngineError};
use crate::handler::{HandlerRegistry, JobOutput, TaskContext};
use crate::job::{Job, JobError, JobKind, JobProgress, JobStatus};
use crate::retry::{decide, RetryDecision};
use crate::routing::{dlx_name, queue_name, DEAD_LETTER_ROUTING_KEY};

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Kinds this worker class is allowed to execute.
    pub kinds: Vec<JobKind>,
    /// Cooperative task slots per kind; each holds one prefetch-1 consumer.
    pub slots_per_kind: usize,
    /// Pause before re-subscribing after a consume failure.
    pub resubscribe_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: crate::ids::new_worker_id(),
            kinds: JobKind::ALL.to_vec(),
            slots_per_kind: 1,
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn for_kinds(kinds: impl IntoIterator<Item = JobKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// Long-running worker service.
pub struct WorkerRuntime {
    engine: Engine,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl WorkerRuntime {
    pub fn new(engine: Engine, registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            engine,
            registry,
            config,
        }
    }

    /// Run until the shutdown token fires. In-flight tasks run to completion;
    /// the slot stops before the next consume.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        info!(
            worker_id = %self.config.worker_id,
            kinds = ?self.config.kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            slots_per_kind = self.config.slots_per_kind,
            "worker starting"
        );

        let mut handles = Vec::new();
        for &kind in &self.config.kinds {
            if !self.registry.is_registered(kind) {
                warn!(kind = %kind, "no handler registered, skipping kind");
                continue;
            }
            for slot in 0..self.config.slots_per_kind.max(1) {
                let engine = self.engine.clone();
                let registry = self.registry.clone();
                let worker_id = format!("{}#{}", self.config.worker_id, slot);
                let shutdown = shutdown.clone();
                let backoff = self.config.resubscribe_backoff;
                handles.push(tokio::spawn(async move {
                    run_slot(engine, registry, kind, worker_id, backoff, shutdown).await;
                }));
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }
}

async fn run_slot(
    engine: Engine,
    registry: Arc<HandlerRegistry>,
    kind: JobKind,
    worker_id: String,
    resubscribe_backoff: Duration,
    shutdown: CancellationToken,
) {
    let queue = queue_name(kind);
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let mut source = match engine.broker().subscribe(&queue, 1).await {
            Ok(source) => source,
            Err(err) => {
                warn!(queue = %queue, error = %err, "subscribe failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(resubscribe_backoff) => continue,
                }
            }
        };

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = source.next() => next,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    process_delivery(&engine, &registry, kind, &worker_id, delivery).await;
                }
                Ok(None) => {
                    debug!(queue = %queue, "subscription closed, re-subscribing");
                    break;
                }
                Err(err) => {
                    warn!(queue = %queue, error = %err, "consume failed, re-subscribing");
                    tokio::time::sleep(resubscribe_backoff).await;
                    break;
                }
            }
        }
    }
}

async fn process_delivery(
    engine: &Engine,
    registry: &HandlerRegistry,
    kind: JobKind,
    worker_id: &str,
    delivery: TaskDelivery,
) {
    let payload = delivery.payload.clone();
    let acker = delivery.acker;

    // Envelope contract: schema, size, kind allowed for this worker class.
    let envelope = match TaskEnvelope::from_bytes(&payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(queue = %queue_name(kind), error = %err, "malformed envelope, dead-lettering");
            metrics::counter!("lathe_envelope_rejected_total", "kind" => kind.as_str()).increment(1);
            if let Err(nack_err) = acker.nack(false).await {
                error!(error = %nack_err, "nack of malformed envelope failed");
            }
            return;
        }
    };
    if envelope.kind != kind {
        warn!(
            job_id = envelope.job_id,
            expected = %kind,
            got = %envelope.kind,
            "misrouted envelope, dead-lettering"
        );
        if let Err(err) = acker.nack(false).await {
            error!(error = %err, "nack of misrouted envelope failed");
        }
        return;
    }

    // Claim: queued -> running under optimistic concurrency.
    let mut job = match engine.store().get(envelope.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id = envelope.job_id, "job row missing, acking stale task");
            let _ = acker.ack().await;
            return;
        }
        Err(err) => {
            warn!(job_id = envelope.job_id, error = %err, "store unavailable, requeueing task");
            let _ = acker.nack(true).await;
            return;
        }
    };

    let actor = Some(format!("worker:{worker_id}"));

    if job.status == JobStatus::Queued && job.cancel_requested {
        let payload = engine.audit_payload_for(&job, json!({"observed_by": worker_id}));
        if let Err(err) = engine
            .transition_with_audit(
                &mut job,
                JobStatus::Cancelled,
                event_types::CANCELLED,
                payload,
                actor.clone(),
            )
            .await
        {
            warn!(job_id = job.id, error = %err, "cancel-before-start transition failed");
        }
        let _ = acker.ack().await;
        return;
    }

    match job.status {
        JobStatus::Queued => {}
        JobStatus::Pending | JobStatus::Failed => {
            if job.cancel_requested {
                // The retry path will not republish a cancel-flagged job;
                // drop the stale task.
                let _ = acker.ack().await;
                return;
            }
            // Confirms are awaited before the state update, so a fresh task
            // can arrive while its row still shows the pre-queued status.
            // Requeue with a short pause until the row catches up.
            debug!(
                job_id = job.id,
                status = %job.status,
                "row not queued yet, requeueing delivery"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = acker.nack(true).await;
            return;
        }
        _ => {
            // Terminal or already running elsewhere: ack without work.
            debug!(
                job_id = job.id,
                status = %job.status,
                "job not claimable, acking without work"
            );
            metrics::counter!("lathe_claims_skipped_total", "status" => job.status.as_str())
                .increment(1);
            let _ = acker.ack().await;
            return;
        }
    }

    let claim_payload = engine.audit_payload_for(
        &job,
        json!({"worker_id": worker_id, "dispatch_attempt": envelope.attempt}),
    );
    match engine
        .transition_with_audit(
            &mut job,
            JobStatus::Running,
            event_types::RUNNING,
            claim_payload,
            actor.clone(),
        )
        .await
    {
        Ok(()) => {}
        Err(EngineError::Conflict(ConflictKind::Version | ConflictKind::State { .. })) => {
            // A concurrent claim won the row (broker redelivery race).
            debug!(job_id = job.id, "claim lost to a concurrent worker, acking");
            metrics::counter!("lathe_claims_lost_total", "kind" => kind.as_str()).increment(1);
            let _ = acker.ack().await;
            return;
        }
        Err(err) => {
            warn!(job_id = job.id, error = %err, "claim failed, requeueing");
            let _ = acker.nack(true).await;
            return;
        }
    }

    info!(
        job_id = job.id,
        worker_id,
        attempt = job.attempts,
        trace_id = %job.trace_id,
        "task claimed"
    );

    let handler = match registry.get(kind) {
        Some(handler) => handler,
        None => {
            // Registration raced the allowed-kind list; treat as fatal.
            settle_failure(
                engine,
                &mut job,
                &payload,
                EngineError::Fatal {
                    message: format!("no handler registered for kind {kind}"),
                },
                actor.clone(),
            )
            .await;
            let _ = acker.ack().await;
            return;
        }
    };

    let ctx = TaskContext::new(
        engine.clone(),
        job.id,
        kind,
        job.attempts,
        job.trace_id.clone(),
    );
    let budget = Duration::from_millis(engine.routing().policy(kind).wall_clock_ms);
    let started = engine.clock().now();

    let outcome = tokio::time::timeout(budget, handler.run(&ctx, envelope.params.clone())).await;

    // Progress writes and cancel requests bump the row version during the
    // run; settle transitions need the current row.
    if let Ok(Some(fresh)) = engine.store().get(job.id).await {
        job = fresh;
    }

    match outcome {
        Err(_elapsed) => {
            let payload = engine.audit_payload_for(
                &job,
                json!({"budget_ms": budget.as_millis() as u64}),
            );
            job.error = Some(JobError {
                code: "TIMEOUT".to_string(),
                message: format!("wall clock budget of {} ms exceeded", budget.as_millis()),
                retryable: false,
            });
            if let Err(err) = engine
                .transition_with_audit(
                    &mut job,
                    JobStatus::Timeout,
                    event_types::TIMEOUT,
                    payload,
                    actor.clone(),
                )
                .await
            {
                error!(job_id = job.id, error = %err, "timeout transition failed");
            }
            metrics::counter!("lathe_tasks_timed_out_total", "kind" => kind.as_str()).increment(1);
            engine.progress_throttle().forget(job.id);
            let _ = acker.ack().await;
        }
        Ok(Ok(output)) => {
            settle_success(engine, &mut job, output, started, actor).await;
            engine.progress_throttle().forget(job.id);
            let _ = acker.ack().await;
        }
        Ok(Err(handler_err)) => {
            let engine_err = handler_err.into_engine_error();
            if matches!(engine_err, EngineError::Cancelled) {
                let payload = engine.audit_payload_for(&job, json!({"observed_by": worker_id}));
                if let Err(err) = engine
                    .transition_with_audit(
                        &mut job,
                        JobStatus::Cancelled,
                        event_types::CANCELLED,
                        payload,
                        actor.clone(),
                    )
                    .await
                {
                    error!(job_id = job.id, error = %err, "cancel transition failed");
                }
                metrics::counter!("lathe_tasks_cancelled_total", "kind" => kind.as_str())
                    .increment(1);
            } else {
                settle_failure(engine, &mut job, &payload, engine_err, actor).await;
            }
            engine.progress_throttle().forget(job.id);
            let _ = acker.ack().await;
        }
    }
}

async fn settle_success(
    engine: &Engine,
    job: &mut Job,
    output: JobOutput,
    started: chrono::DateTime<chrono::Utc>,
    actor: Option<String>,
) {
    let duration_ms = (engine.clock().now() - started).num_milliseconds().max(0);
    job.artefacts.extend(output.artefacts);
    job.progress = JobProgress {
        percent: 100,
        step: Some("completed".to_string()),
        message: job.progress.message.clone(),
        updated_at: Some(engine.clock().now()),
    };
    let payload = engine.audit_payload_for(
        job,
        json!({
            "duration_ms": duration_ms,
            "output": output.metadata,
            "artefacts": job.artefacts.len(),
        }),
    );
    if let Err(err) = engine
        .transition_with_audit(job, JobStatus::Succeeded, event_types::SUCCEEDED, payload, actor)
        .await
    {
        error!(job_id = job.id, error = %err, "success transition failed");
        return;
    }
    metrics::counter!("lathe_tasks_succeeded_total", "kind" => job.kind.as_str()).increment(1);
    metrics::histogram!("lathe_task_duration_ms", "kind" => job.kind.as_str())
        .record(duration_ms as f64);
    info!(job_id = job.id, duration_ms, "task succeeded");
}

/// Classify a failure and route it: retry with backoff, or dead-letter.
async fn settle_failure(
    engine: &Engine,
    job: &mut Job,
    envelope_bytes: &[u8],
    err: EngineError,
    actor: Option<String>,
) {
    let policy = engine.routing().policy(job.kind).clone();
    let decision = decide(err.class(), job.attempts, &policy);
    job.error = Some(JobError::from_engine_error(&err));

    match decision {
        RetryDecision::Retry { delay } => {
            let payload = engine.audit_payload_for(
                job,
                json!({
                    "code": err.code(),
                    "delay_ms": delay.as_millis() as u64,
                    "next_dispatch": job.attempts + 1,
                }),
            );
            if let Err(transition_err) = engine
                .transition_with_audit(job, JobStatus::Failed, event_types::RETRYING, payload, actor.clone())
                .await
            {
                error!(job_id = job.id, error = %transition_err, "retry transition failed");
                return;
            }
            metrics::counter!("lathe_tasks_retried_total", "kind" => job.kind.as_str()).increment(1);
            warn!(
                job_id = job.id,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                code = err.code(),
                "task failed, scheduling retry"
            );

            let engine = engine.clone();
            let job_id = job.id;
            let retry_policy = policy.clone();
            let mut dispatch = job.attempts + 1;
            tokio::spawn(async move {
                let mut delay = delay;
                loop {
                    tokio::time::sleep(delay).await;
                    let mut job = match engine.store().get(job_id).await {
                        Ok(Some(job)) => job,
                        Ok(None) => return,
                        Err(err) => {
                            error!(job_id, error = %err, "retry republish could not load job");
                            return;
                        }
                    };
                    if job.status != JobStatus::Failed || job.cancel_requested {
                        debug!(job_id, status = %job.status, "retry republish skipped");
                        return;
                    }
                    match engine
                        .publish_with_confirm(&mut job, dispatch, Some("system:retry".to_string()))
                        .await
                    {
                        Ok(()) => return,
                        Err(err) => {
                            // Confirm retries exhausted: this dispatch counts
                            // as a consumed attempt and goes back through the
                            // routing policy so the job cannot strand in
                            // `failed`.
                            match decide(err.class(), dispatch, &retry_policy) {
                                RetryDecision::Retry { delay: next_delay } => {
                                    warn!(
                                        job_id,
                                        dispatch,
                                        error = %err,
                                        "retry dispatch not confirmed, rescheduling"
                                    );
                                    dispatch += 1;
                                    delay = next_delay;
                                }
                                RetryDecision::DeadLetter => {
                                    dead_letter_exhausted(&engine, &job, &err).await;
                                    return;
                                }
                                RetryDecision::Drop => return,
                            }
                        }
                    }
                }
            });
        }
        RetryDecision::DeadLetter => {
            let first_seen = job.created_at.to_rfc3339();
            let publication = Publication::new(
                dlx_name(job.kind),
                DEAD_LETTER_ROUTING_KEY,
                envelope_bytes.to_vec(),
            )
            .with_header(headers::LAST_ERROR, err.code())
            .with_header(headers::ATTEMPTS, job.attempts.to_string())
            .with_header(headers::FIRST_SEEN, first_seen);

            if let Err(publish_err) = engine.broker().publish(publication).await {
                error!(job_id = job.id, error = %publish_err, "dead-letter publish failed");
            } else {
                metrics::counter!("lathe_dlq_total", "kind" => job.kind.as_str()).increment(1);
            }

            let payload = engine.audit_payload_for(
                job,
                json!({
                    "code": err.code(),
                    "retryable": err.is_retryable(),
                    "dead_lettered": true,
                }),
            );
            if let Err(transition_err) = engine
                .transition_with_audit(job, JobStatus::Failed, event_types::FAILED, payload, actor)
                .await
            {
                error!(job_id = job.id, error = %transition_err, "failure transition failed");
            }
            warn!(job_id = job.id, code = err.code(), "task dead-lettered");
        }
        RetryDecision::Drop => {
            // Cancellation and timeout settle through their own paths.
            debug!(job_id = job.id, code = err.code(), "failure dropped without retry");
        }
    }
}

/// Dead-letter a job whose retry dispatch could never be published. The row
/// already shows `failed` (there is no `failed -> failed` transition), so
/// this routes the task to the DLQ and appends the final `failed` event
/// without a state change.
async fn dead_letter_exhausted(engine: &Engine, job: &Job, err: &EngineError) {
    let code = job
        .error
        .as_ref()
        .map(|e| e.code.clone())
        .unwrap_or_else(|| err.code().to_string());

    match TaskEnvelope::for_job(job, job.attempts)
        .and_then(|envelope| envelope.to_canonical_bytes())
    {
        Ok(bytes) => {
            let publication =
                Publication::new(dlx_name(job.kind), DEAD_LETTER_ROUTING_KEY, bytes)
                    .with_header(headers::LAST_ERROR, code.as_str())
                    .with_header(headers::ATTEMPTS, job.attempts.to_string())
                    .with_header(headers::FIRST_SEEN, job.created_at.to_rfc3339());
            match engine.broker().publish(publication).await {
                Ok(_) => {
                    metrics::counter!("lathe_dlq_total", "kind" => job.kind.as_str()).increment(1);
                }
                Err(publish_err) => {
                    error!(job_id = job.id, error = %publish_err, "dead-letter publish failed");
                }
            }
        }
        Err(encode_err) => {
            error!(job_id = job.id, error = %encode_err, "dead-letter envelope rebuild failed");
        }
    }

    let payload = engine.audit_payload_for(
        job,
        json!({
            "code": code.as_str(),
            "retryable": err.is_retryable(),
            "dead_lettered": true,
        }),
    );
    if let Err(audit_err) = engine
        .audit()
        .append(
            AuditScope::job(job.id),
            event_types::FAILED,
            payload,
            Some("system:retry".to_string()),
        )
        .await
    {
        error!(job_id = job.id, error = %audit_err, "dead-letter audit append failed");
    }
    warn!(job_id = job.id, code = %code, "retry dispatch exhausted, task dead-lettered");
}
