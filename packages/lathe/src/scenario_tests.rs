//! End-to-end lifecycle scenarios over the in-memory collaborators.
//!
//! These exercise the engine the way production does: submit through intake,
//! consume through the worker runtime, and assert on the job store, the
//! broker queues and the audit chains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::audit::{compute_chain_hash, event_types, AuditScope};
use crate::clock::Clock;
use crate::envelope::{TaskEnvelope, TaskParams};
use crate::error::{ConflictKind, EngineError};
use crate::handler::{HandlerError, HandlerRegistry, JobHandler, JobOutput, TaskContext};
use crate::identity::{ActorAssertion, SecondFactor, SecondFactorMethod};
use crate::intake::SubmitRequest;
use crate::job::{JobId, JobKind, JobStatus};
use crate::progress::ProgressOutcome;
use crate::replay::ReplayFilter;
use crate::routing::{dlq_name, queue_name, RoutingTable};
use crate::testing::{harness, harness_with_config, harness_with_routing, TestHarness, TEST_OPERATOR};
use crate::worker::{WorkerConfig, WorkerRuntime};

const OWNER: i64 = 42;

fn actor() -> ActorAssertion {
    ActorAssertion::user(OWNER)
}

fn operator(h: &TestHarness) -> ActorAssertion {
    ActorAssertion::operator(
        TEST_OPERATOR,
        SecondFactor {
            method: SecondFactorMethod::Totp,
            verified_at: h.clock.now(),
        },
    )
}

fn request(kind: &str, params: serde_json::Value, key: &str) -> SubmitRequest {
    SubmitRequest {
        kind: kind.to_string(),
        params,
        idempotency_key: key.to_string(),
        priority: Some(5),
        trace_id: None,
    }
}

async fn wait_for_job(
    h: &TestHarness,
    job_id: JobId,
    what: &str,
    pred: impl Fn(&crate::job::Job) -> bool,
) {
    for _ in 0..5_000 {
        if let Some(job) = h.store.job(job_id) {
            if pred(&job) {
                // Let the audit append that trails the store update land.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn wait_for_depth(h: &TestHarness, queue: &str, depth: usize, what: &str) {
    for _ in 0..5_000 {
        if h.broker.depth(queue) == depth {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn spawn_worker(h: &TestHarness, kinds: Vec<JobKind>, registry: HandlerRegistry) -> CancellationToken {
    let runtime = WorkerRuntime::new(
        h.engine.clone(),
        Arc::new(registry),
        WorkerConfig {
            worker_id: "w-test".to_string(),
            kinds,
            slots_per_kind: 1,
            resubscribe_backoff: Duration::from_millis(50),
        },
    );
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        let _ = runtime.run(child).await;
    });
    token
}

// ----------------------------------------------------------------------------
// Test handlers
// ----------------------------------------------------------------------------

struct SucceedingHandler;

#[async_trait]
impl JobHandler for SucceedingHandler {
    async fn run(&self, ctx: &TaskContext, _params: TaskParams) -> Result<JobOutput, HandlerError> {
        ctx.checkpoint().await?;
        ctx.report_progress(50, "meshing", "halfway there").await;
        Ok(JobOutput {
            metadata: json!({"triangles": 1284}),
            artefacts: Vec::new(),
        })
    }
}

struct AlwaysTransient;

#[async_trait]
impl JobHandler for AlwaysTransient {
    async fn run(&self, _ctx: &TaskContext, _params: TaskParams) -> Result<JobOutput, HandlerError> {
        Err(HandlerError::transient("solver backend unreachable"))
    }
}

/// Loops with a checkpoint every 50 ms until cancelled (or an implausibly
/// long run completes).
struct CheckpointLoop;

#[async_trait]
impl JobHandler for CheckpointLoop {
    async fn run(&self, ctx: &TaskContext, _params: TaskParams) -> Result<JobOutput, HandlerError> {
        for step in 0..400 {
            ctx.checkpoint().await?;
            ctx.report_progress((step / 4).min(100) as i16, "cutting", "toolpath pass")
                .await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(JobOutput::empty())
    }
}

/// Drive one model job through repeated transient failures into the DLQ.
async fn drive_to_dlq(h: &TestHarness) -> JobId {
    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Model, Arc::new(AlwaysTransient));
    let worker = spawn_worker(h, vec![JobKind::Model], registry);

    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 10, "w": 5}), "dlq-case"))
        .await
        .unwrap();

    wait_for_depth(h, &dlq_name(JobKind::Model), 1, "message dead-lettered").await;
    wait_for_job(h, outcome.job_id, "job settled failed", |job| {
        job.status == JobStatus::Failed && job.error.is_some()
    })
    .await;
    worker.cancel();
    outcome.job_id
}

// ----------------------------------------------------------------------------
// Scenario 1: idempotent submit
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn idempotent_submit_creates_exactly_one_job() {
    let h = harness().await;

    let first = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 10, "w": 5}), "abc"))
        .await
        .unwrap();
    assert!(first.created);
    assert_eq!(first.status, JobStatus::Queued);
    assert_eq!(first.queue, "q.model");

    let second = h
        .engine
        .submit_job(&actor(), request("model", json!({"w": 5, "l": 10.0}), "abc"))
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.job_id, first.job_id);

    let conflict = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 11, "w": 5}), "abc"))
        .await
        .unwrap_err();
    assert!(matches!(
        conflict,
        EngineError::Conflict(ConflictKind::Idempotency)
    ));

    assert_eq!(h.store.job_count(), 1);
    assert_eq!(h.broker.depth(&queue_name(JobKind::Model)), 1);
}

// ----------------------------------------------------------------------------
// Scenario 2: publish confirm gates the queued transition
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queued_requires_broker_confirm_and_chains_the_audit() {
    let h = harness().await;
    h.broker.set_confirm_delay(Duration::from_millis(300));

    let engine = h.engine.clone();
    let submit = tokio::spawn(async move {
        engine
            .submit_job(&actor(), request("model", json!({"l": 10}), "slow-confirm"))
            .await
    });

    // Let intake run up to the pending confirm.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = h.store.job(1).expect("row created before the confirm");
    assert_eq!(job.status, JobStatus::Pending);

    // Ride out the confirm delay.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let outcome = submit.await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Queued);

    let scope = AuditScope::job(outcome.job_id);
    let trail = h.engine.audit().trail(&scope).await.unwrap();
    assert_eq!(trail, vec!["created", "queued"]);

    let verification = h.engine.verify_job_audit(outcome.job_id).await.unwrap();
    assert!(verification.is_valid());

    // Recompute event #2 by hand against the stored value.
    let events = h.engine.audit().trail(&scope).await.unwrap();
    assert_eq!(events.len(), 2);
    let stored = {
        use crate::audit::AuditStore;
        h.audit.list(&scope).await.unwrap()
    };
    let recomputed = compute_chain_hash(
        &stored[0].chain_hash,
        &stored[1].payload,
        &scope,
        &stored[1].event_type,
        stored[1].seq,
    );
    assert_eq!(recomputed, stored[1].chain_hash);
    assert_eq!(stored[1].prev_hash, stored[0].chain_hash);
}

// ----------------------------------------------------------------------------
// Scenario 3: cooperative cancellation mid-run
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_lands_at_the_next_checkpoint() {
    let h = harness().await;
    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Cam, Arc::new(CheckpointLoop));
    let worker = spawn_worker(&h, vec![JobKind::Cam], registry);

    let outcome = h
        .engine
        .submit_job(&actor(), request("cam", json!({"op": "profile"}), "cancel-me"))
        .await
        .unwrap();
    wait_for_job(&h, outcome.job_id, "job running", |job| {
        job.status == JobStatus::Running
    })
    .await;

    let first = h
        .engine
        .request_cancel(&actor(), outcome.job_id, Some("user change of mind".into()))
        .await
        .unwrap();
    assert!(first.accepted);

    // Issued immediately after: the flag is already set, no second event.
    let second = h
        .engine
        .request_cancel(&actor(), outcome.job_id, None)
        .await
        .unwrap();
    assert!(second.already_requested);
    assert!(!second.accepted);

    wait_for_job(&h, outcome.job_id, "job cancelled", |job| {
        job.status == JobStatus::Cancelled
    })
    .await;

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(outcome.job_id))
        .await
        .unwrap();
    let cancel_requests = trail.iter().filter(|t| *t == "cancel_requested").count();
    assert_eq!(cancel_requests, 1);
    assert_eq!(trail.last().map(String::as_str), Some("cancelled"));
    assert!(trail.contains(&"cancel_requested".to_string()));

    // Terminal now: a further request reports that and nothing else changes.
    let third = h
        .engine
        .request_cancel(&actor(), outcome.job_id, None)
        .await
        .unwrap();
    assert!(third.already_terminal);

    worker.cancel();
}

// ----------------------------------------------------------------------------
// Scenario 4: transient retries with jitter, then DLQ
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_then_dead_letter() {
    let h = harness().await;
    let job_id = drive_to_dlq(&h).await;

    let job = h.store.job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    let error = job.error.unwrap();
    assert!(error.retryable);

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(job_id))
        .await
        .unwrap();
    assert_eq!(
        trail,
        vec![
            "created", "queued", "running", "retrying", "queued", "running", "retrying",
            "queued", "running", "failed",
        ]
    );

    // The DLQ holds the failure exactly once, with its enrichment headers.
    assert_eq!(h.broker.depth(&dlq_name(JobKind::Model)), 1);
    let summaries = h
        .engine
        .list_dlq(&operator(&h), JobKind::Model, 10)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].job_id, job_id);
    assert_eq!(summaries[0].attempt, 3);
    assert_eq!(summaries[0].last_error.as_deref(), Some("TRANSIENT"));
    assert!(summaries[0].first_seen.is_some());
    // Browsing left the message in place.
    assert_eq!(h.broker.depth(&dlq_name(JobKind::Model)), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_republish_exhaustion_dead_letters_instead_of_stranding() {
    let h = harness().await;
    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Model, Arc::new(AlwaysTransient));
    let worker = spawn_worker(&h, vec![JobKind::Model], registry);

    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 4}), "broker-gone"))
        .await
        .unwrap();
    // The broker goes dark after the first publish: every re-dispatch
    // (4 confirm attempts each, for dispatches 2 and 3) is nacked.
    h.broker.fail_next_publishes(8);

    wait_for_depth(&h, &dlq_name(JobKind::Model), 1, "unpublishable retry dead-lettered").await;
    wait_for_job(&h, outcome.job_id, "job settled failed", |job| {
        job.status == JobStatus::Failed
            && job.error.as_ref().map(|e| e.code.as_str()) == Some("PUBLISH_FAILED")
    })
    .await;

    let job = h.store.job(outcome.job_id).unwrap();
    assert_eq!(job.attempts, 1, "no dispatch ever reached a worker again");
    assert_eq!(h.broker.depth(&queue_name(JobKind::Model)), 0);

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(outcome.job_id))
        .await
        .unwrap();
    assert_eq!(
        trail,
        vec!["created", "queued", "running", "retrying", "failed"]
    );

    let summaries = h
        .engine
        .list_dlq(&operator(&h), JobKind::Model, 10)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].job_id, outcome.job_id);
    assert_eq!(summaries[0].last_error.as_deref(), Some("PUBLISH_FAILED"));

    worker.cancel();
}

// ----------------------------------------------------------------------------
// Scenario 5: stale redelivery loses the claim
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_redelivery_is_acked_without_work() {
    let h = harness().await;

    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 3}), "stale"))
        .await
        .unwrap();

    // First worker claims the task out of band.
    let mut job = h.store.job(outcome.job_id).unwrap();
    let payload = h.engine.audit_payload_for(&job, json!({"worker_id": "w1"}));
    h.engine
        .transition_with_audit(
            &mut job,
            JobStatus::Running,
            event_types::RUNNING,
            payload,
            Some("worker:w1".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(job.attempts, 1);

    // The broker still holds the original delivery; a second worker gets it.
    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Model, Arc::new(SucceedingHandler));
    let worker = spawn_worker(&h, vec![JobKind::Model], registry);

    wait_for_depth(&h, &queue_name(JobKind::Model), 0, "redelivery consumed").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let job = h.store.job(outcome.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Running, "second claim must not win");
    assert_eq!(job.attempts, 1, "no duplicate attempts increment");

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(outcome.job_id))
        .await
        .unwrap();
    let running_events = trail.iter().filter(|t| *t == "running").count();
    assert_eq!(running_events, 1, "no duplicate running audit event");

    worker.cancel();
}

// ----------------------------------------------------------------------------
// Scenario 6: DLQ replay
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dlq_replay_requeues_with_an_attempt_floor() {
    let h = harness().await;
    let job_id = drive_to_dlq(&h).await;

    let report = h
        .engine
        .replay_dlq(&operator(&h), JobKind::Model, ReplayFilter::all(10))
        .await
        .unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.new_task_ids.len(), 1);
    assert!(report.aborted.is_none());

    assert_eq!(h.broker.depth(&dlq_name(JobKind::Model)), 0);
    assert_eq!(h.broker.depth(&queue_name(JobKind::Model)), 1);

    // The replayed envelope keeps the original job id and a softened attempt.
    let delivery = h
        .engine
        .broker()
        .get(&queue_name(JobKind::Model))
        .await
        .unwrap()
        .unwrap();
    let envelope = TaskEnvelope::from_bytes(&delivery.payload).unwrap();
    assert_eq!(envelope.job_id, job_id);
    assert_eq!(envelope.attempt, 2, "attempts floored below the retry budget");
    delivery.acker.nack(true).await.unwrap();

    let job = h.store.job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(job_id))
        .await
        .unwrap();
    assert!(trail.contains(&"dlq_replayed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn dlq_replay_aborts_cleanly_on_broker_failure() {
    let h = harness().await;
    drive_to_dlq(&h).await;

    h.broker.fail_next_publishes(1);
    let report = h
        .engine
        .replay_dlq(&operator(&h), JobKind::Model, ReplayFilter::all(10))
        .await
        .unwrap();
    assert_eq!(report.replayed, 0);
    assert!(report.aborted.is_some());
    // The message stays in the DLQ for a later retry.
    assert_eq!(h.broker.depth(&dlq_name(JobKind::Model)), 1);
}

#[tokio::test(start_paused = true)]
async fn dlq_paths_require_an_operator_with_second_factor() {
    let h = harness().await;
    let err = h
        .engine
        .list_dlq(&actor(), JobKind::Model, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden));

    let no_second_factor = ActorAssertion::user(TEST_OPERATOR);
    let err = h
        .engine
        .replay_dlq(&no_second_factor, JobKind::Model, ReplayFilter::all(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized));
}

#[tokio::test(start_paused = true)]
async fn dlq_purge_is_audited() {
    let h = harness().await;
    drive_to_dlq(&h).await;

    let purged = h.engine.purge_dlq(&operator(&h), JobKind::Model).await.unwrap();
    assert_eq!(purged, 1);
    assert_eq!(h.broker.depth(&dlq_name(JobKind::Model)), 0);

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::queue(JobKind::Model))
        .await
        .unwrap();
    assert_eq!(trail, vec!["dlq_purged"]);
}

// ----------------------------------------------------------------------------
// Audit chain integrity
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn mutating_any_event_is_reported_at_its_index() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("sim", json!({"steps": 100}), "tamper"))
        .await
        .unwrap();
    let scope = AuditScope::job(outcome.job_id);

    assert!(h.engine.verify_job_audit(outcome.job_id).await.unwrap().is_valid());

    assert!(h.audit.tamper(&scope, 1, |event| {
        event.payload["queue"] = json!("q.somewhere-else");
    }));

    let verification = h.engine.verify_job_audit(outcome.job_id).await.unwrap();
    assert_eq!(verification.violation_index(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn forged_events_break_the_chain() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("sim", json!({"steps": 2}), "forge"))
        .await
        .unwrap();
    let scope = AuditScope::job(outcome.job_id);

    let stored = {
        use crate::audit::AuditStore;
        h.audit.list(&scope).await.unwrap()
    };
    let mut forged = stored.last().unwrap().clone();
    forged.seq += 2; // sequence gap
    forged.event_type = "succeeded".to_string();
    h.audit.insert_forged(forged);

    let verification = h.engine.verify_job_audit(outcome.job_id).await.unwrap();
    assert_eq!(verification.violation_index(), Some(stored.len()));
}

// ----------------------------------------------------------------------------
// Progress
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn progress_is_monotonic_and_throttled() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 1}), "progress"))
        .await
        .unwrap();
    let job_id = outcome.job_id;

    let mut job = h.store.job(job_id).unwrap();
    let payload = h.engine.audit_payload_for(&job, json!({}));
    h.engine
        .transition_with_audit(
            &mut job,
            JobStatus::Running,
            event_types::RUNNING,
            payload,
            None,
        )
        .await
        .unwrap();

    let first = h
        .engine
        .report_progress(job_id, 10, Some("setup".into()), None)
        .await
        .unwrap();
    assert_eq!(first, ProgressOutcome::Persisted);

    // Same throttle window: coalesced.
    let throttled = h
        .engine
        .report_progress(job_id, 20, Some("setup".into()), None)
        .await
        .unwrap();
    assert_eq!(throttled, ProgressOutcome::Throttled);
    assert_eq!(h.store.job(job_id).unwrap().progress.percent, 10);

    h.clock.advance(chrono::Duration::milliseconds(150));
    let second = h
        .engine
        .report_progress(job_id, 20, Some("cutting".into()), None)
        .await
        .unwrap();
    assert_eq!(second, ProgressOutcome::Persisted);
    assert_eq!(h.store.job(job_id).unwrap().progress.percent, 20);

    h.clock.advance(chrono::Duration::milliseconds(150));
    let backwards = h
        .engine
        .report_progress(job_id, 15, None, None)
        .await
        .unwrap();
    assert_eq!(backwards, ProgressOutcome::DroppedMonotonic);
    assert_eq!(h.store.job(job_id).unwrap().progress.percent, 20);

    assert!(h
        .engine
        .report_progress(job_id, 200, None, None)
        .await
        .is_err());

    let mut job = h.store.job(job_id).unwrap();
    let payload = h.engine.audit_payload_for(&job, json!({}));
    h.engine
        .transition_with_audit(
            &mut job,
            JobStatus::Succeeded,
            event_types::SUCCEEDED,
            payload,
            None,
        )
        .await
        .unwrap();
    let settled = h
        .engine
        .report_progress(job_id, 90, None, None)
        .await
        .unwrap();
    assert_eq!(settled, ProgressOutcome::DroppedSettled);
}

// ----------------------------------------------------------------------------
// Cancellation idempotence under concurrency
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_cancel_requests_yield_one_audit_event() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("erp", json!({"sync": true}), "multi-cancel"))
        .await
        .unwrap();

    let mut joins = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let job_id = outcome.job_id;
        joins.push(tokio::spawn(async move {
            engine.request_cancel(&actor(), job_id, None).await
        }));
    }

    let mut accepted = 0;
    for join in joins {
        let result = join.await.unwrap().unwrap();
        assert!(result.cancel_requested);
        if result.accepted {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 1, "exactly one request wins the flag");

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(outcome.job_id))
        .await
        .unwrap();
    let cancel_events = trail.iter().filter(|t| *t == "cancel_requested").count();
    assert_eq!(cancel_events, 1);
}

#[tokio::test(start_paused = true)]
async fn check_cancel_survives_a_cache_outage() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("erp", json!({"sync": 1}), "cache-out"))
        .await
        .unwrap();

    h.engine
        .request_cancel(&actor(), outcome.job_id, None)
        .await
        .unwrap();
    assert!(h.cache.contains(&format!("cancel:{}", outcome.job_id)));

    h.cache.fail_next_reads(1);
    assert!(h.engine.check_cancel(outcome.job_id).await.unwrap());
}

// ----------------------------------------------------------------------------
// Intake edges
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn oversized_params_are_rejected_without_a_row() {
    let h = harness().await;
    let blob = "x".repeat(300 * 1024);
    let err = h
        .engine
        .submit_job(&actor(), request("model", json!({"blob": blob}), "too-big"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PayloadTooLarge { .. }));
    assert_eq!(h.store.job_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_kind_and_bad_priority_are_validation_errors() {
    let h = harness().await;
    let err = h
        .engine
        .submit_job(&actor(), request("welding", json!({}), "k1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));

    let mut req = request("model", json!({}), "k2");
    req.priority = Some(11);
    let err = h.engine.submit_job(&actor(), req).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(h.store.job_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_submissions_create_nothing() {
    let h = harness_with_config(crate::config::EngineConfig {
        per_owner_rps: 2,
        global_rps: 10_000,
        ..crate::config::EngineConfig::default()
    })
    .await;

    h.engine
        .submit_job(&actor(), request("model", json!({"n": 1}), "rl-1"))
        .await
        .unwrap();
    h.engine
        .submit_job(&actor(), request("model", json!({"n": 2}), "rl-2"))
        .await
        .unwrap();
    let err = h
        .engine
        .submit_job(&actor(), request("model", json!({"n": 3}), "rl-3"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RateLimited));
    assert_eq!(h.store.job_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn publish_exhaustion_fails_the_job_but_keeps_the_row() {
    let h = harness().await;
    h.broker.fail_next_publishes(4);

    let err = h
        .engine
        .submit_job(&actor(), request("report", json!({"fmt": "pdf"}), "no-broker"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Transient { .. }));

    assert_eq!(h.store.job_count(), 1);
    let job = h.store.job(1).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.code, "PUBLISH_FAILED");
    assert!(error.retryable);

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(job.id))
        .await
        .unwrap();
    assert_eq!(trail, vec!["created", "failed"]);
}

// ----------------------------------------------------------------------------
// Status views
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn status_view_masks_other_owners_and_positions_queued_jobs() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 9}), "view"))
        .await
        .unwrap();

    let view = h.engine.job_status(&actor(), outcome.job_id).await.unwrap();
    assert_eq!(view.status, JobStatus::Queued);
    assert_eq!(view.queue_position, Some(0));
    assert!(view.weak_etag().starts_with("W/\""));
    assert!(view.matches(&view.weak_etag()));

    let stranger = ActorAssertion::user(4242);
    let err = h
        .engine
        .job_status(&stranger, outcome.job_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn queue_position_orders_by_priority_then_enqueue_time() {
    let h = harness().await;
    let mut ids = Vec::new();
    for (n, priority) in [(1, 5), (2, 9), (3, 5), (4, 9)] {
        let mut req = request("cam", json!({"n": n}), &format!("pos-{n}"));
        req.priority = Some(priority);
        let outcome = h.engine.submit_job(&actor(), req).await.unwrap();
        ids.push(outcome.job_id);
        h.clock.advance(chrono::Duration::milliseconds(10));
    }

    let positions: Vec<u64> = {
        let mut out = Vec::new();
        for id in &ids {
            let job = h.store.job(*id).unwrap();
            out.push(h.engine.queue_position(&job).await.unwrap().unwrap());
        }
        out
    };
    // Dispatch order: job2 (prio 9, earlier), job4 (prio 9), job1, job3.
    assert_eq!(positions, vec![2, 0, 3, 1]);
}

// ----------------------------------------------------------------------------
// Worker end-to-end success
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn successful_task_settles_with_full_progress_and_audit() {
    let h = harness().await;
    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Model, Arc::new(SucceedingHandler));
    let worker = spawn_worker(&h, vec![JobKind::Model], registry);

    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 10}), "happy"))
        .await
        .unwrap();

    wait_for_job(&h, outcome.job_id, "job succeeded", |job| {
        job.status == JobStatus::Succeeded
    })
    .await;

    let job = h.store.job(outcome.job_id).unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.progress.percent, 100);
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());
    assert!(job.task_id.is_some());

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(outcome.job_id))
        .await
        .unwrap();
    assert_eq!(trail, vec!["created", "queued", "running", "succeeded"]);
    assert!(h.engine.verify_job_audit(outcome.job_id).await.unwrap().is_valid());

    worker.cancel();
}

// ----------------------------------------------------------------------------
// Wall-clock timeout
// ----------------------------------------------------------------------------

struct NeverFinishes;

#[async_trait]
impl JobHandler for NeverFinishes {
    async fn run(&self, _ctx: &TaskContext, _params: TaskParams) -> Result<JobOutput, HandlerError> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        Ok(JobOutput::empty())
    }
}

#[tokio::test(start_paused = true)]
async fn exceeding_the_wall_clock_budget_settles_as_timeout() {
    let mut routing = RoutingTable::standard();
    let mut policy = routing.policy(JobKind::Model).clone();
    policy.wall_clock_ms = 100;
    routing.set_policy(JobKind::Model, policy);
    let h = harness_with_routing(routing).await;

    let mut registry = HandlerRegistry::new();
    registry.register(JobKind::Model, Arc::new(NeverFinishes));
    let worker = spawn_worker(&h, vec![JobKind::Model], registry);

    let outcome = h
        .engine
        .submit_job(&actor(), request("model", json!({"l": 2}), "deadline"))
        .await
        .unwrap();

    wait_for_job(&h, outcome.job_id, "job timed out", |job| {
        job.status == JobStatus::Timeout
    })
    .await;

    let job = h.store.job(outcome.job_id).unwrap();
    assert!(job.finished_at.is_some());
    assert_eq!(job.error.as_ref().map(|e| e.code.as_str()), Some("TIMEOUT"));

    let trail = h
        .engine
        .audit()
        .trail(&AuditScope::job(outcome.job_id))
        .await
        .unwrap();
    assert_eq!(trail, vec!["created", "queued", "running", "timeout"]);
    // The delivery was acked; nothing is requeued or dead-lettered.
    assert_eq!(h.broker.depth(&queue_name(JobKind::Model)), 0);
    assert_eq!(h.broker.depth(&dlq_name(JobKind::Model)), 0);

    worker.cancel();
}

// ----------------------------------------------------------------------------
// Retention
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retention_purges_terminal_jobs_then_idempotency_records() {
    let h = harness().await;
    let outcome = h
        .engine
        .submit_job(&actor(), request("report", json!({"fmt": "pdf"}), "old"))
        .await
        .unwrap();

    let mut job = h.store.job(outcome.job_id).unwrap();
    let payload = h.engine.audit_payload_for(&job, json!({}));
    h.engine
        .transition_with_audit(&mut job, JobStatus::Running, event_types::RUNNING, payload, None)
        .await
        .unwrap();
    let payload = h.engine.audit_payload_for(&job, json!({}));
    h.engine
        .transition_with_audit(
            &mut job,
            JobStatus::Succeeded,
            event_types::SUCCEEDED,
            payload,
            None,
        )
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::days(31));
    let report = h.engine.run_retention().await.unwrap();
    assert_eq!(report.jobs_purged, 1);
    assert_eq!(report.idempotency_expired, 0, "idempotency horizon is longer");
    assert!(h.store.job(outcome.job_id).is_none());

    h.clock.advance(chrono::Duration::days(15));
    let report = h.engine.run_retention().await.unwrap();
    assert_eq!(report.idempotency_expired, 1);
}
