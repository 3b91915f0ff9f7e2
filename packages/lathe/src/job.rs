//! Job entity and the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::artefact::ArtefactRef;
use crate::error::{ConflictKind, EngineError};

/// Server-assigned 64-bit job identity.
pub type JobId = i64;

/// Opaque tenant/submitter identity, issued by the identity collaborator.
pub type OwnerId = i64;

/// Priority range accepted at intake; higher wins.
pub const PRIORITY_MIN: i16 = 0;
pub const PRIORITY_MAX: i16 = 10;
pub const PRIORITY_DEFAULT: i16 = 5;

/// Idempotency keys are trimmed and must stay within 1..=255 chars.
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 255;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ai,
    Model,
    Cam,
    Sim,
    Report,
    Erp,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Ai,
        JobKind::Model,
        JobKind::Cam,
        JobKind::Sim,
        JobKind::Report,
        JobKind::Erp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ai => "ai",
            JobKind::Model => "model",
            JobKind::Cam => "cam",
            JobKind::Sim => "sim",
            JobKind::Report => "report",
            JobKind::Erp => "erp",
        }
    }

    pub fn parse(value: &str) -> Option<JobKind> {
        match value {
            "ai" => Some(JobKind::Ai),
            "model" => Some(JobKind::Model),
            "cam" => Some(JobKind::Cam),
            "sim" => Some(JobKind::Sim),
            "report" => Some(JobKind::Report),
            "erp" => Some(JobKind::Erp),
            _ => None,
        }
    }

    /// Stable ordinal used when a kind has to stand in for a numeric scope id
    /// (queue-scoped audit events).
    pub fn ordinal(&self) -> i64 {
        match self {
            JobKind::Ai => 0,
            JobKind::Model => 1,
            JobKind::Cam => 2,
            JobKind::Sim => 3,
            JobKind::Report => 4,
            JobKind::Erp => 5,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }

    /// Terminal states are final except through an explicit admin replay.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    /// `failed` keeps the job re-queueable through the retry path; it only
    /// counts as settled once retries are exhausted.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == JobStatus::Failed
    }

    /// The lifecycle transition table. `failed -> queued` is the retry and
    /// DLQ-replay re-entry edge.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Failed, Queued)
                | (Queued, Running)
                | (Running, Succeeded)
                | (Pending, Failed)
                | (Queued, Failed)
                | (Running, Failed)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Running, Cancelled)
                | (Running, Timeout)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Value types
// ============================================================================

/// Last error recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    pub fn from_engine_error(err: &EngineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.message_en(),
            retryable: err.is_retryable(),
        }
    }

    pub fn publish_failed() -> Self {
        Self {
            code: "PUBLISH_FAILED".to_string(),
            message: "broker did not confirm the task publish".to_string(),
            retryable: true,
        }
    }
}

/// Bounded last-progress view kept on the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobProgress {
    pub percent: i16,
    pub step: Option<String>,
    pub message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Job entity
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerId,
    pub kind: JobKind,

    #[builder(default)]
    pub status: JobStatus,

    pub params: serde_json::Value,
    pub idempotency_key: String,

    #[builder(default = PRIORITY_DEFAULT)]
    pub priority: i16,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = false)]
    pub cancel_requested: bool,

    #[builder(default, setter(strip_option))]
    pub task_id: Option<String>,
    pub trace_id: String,

    #[builder(default, setter(strip_option))]
    pub error: Option<JobError>,
    #[builder(default)]
    pub progress: JobProgress,
    #[builder(default)]
    pub artefacts: Vec<ArtefactRef>,

    /// Optimistic concurrency token; bumped by the store on every update.
    #[builder(default = 1)]
    pub version: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Apply a state transition, enforcing the lifecycle table and its
    /// timestamp/attempt invariants. The caller persists via the store's
    /// optimistic update afterwards.
    pub fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.can_transition_to(to) {
            return Err(EngineError::Conflict(ConflictKind::State {
                from: self.status,
                to,
            }));
        }
        if to == JobStatus::Running {
            self.attempts += 1;
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
        }
        if to == JobStatus::Queued {
            self.enqueued_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Request cancellation on the in-memory entity. Monotonic: once set the
    /// flag is never cleared.
    pub fn mark_cancel_requested(&mut self, now: DateTime<Utc>) -> bool {
        if self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        self.updated_at = now;
        true
    }

    /// Compact identity string for structured logs.
    pub fn describe(&self) -> String {
        format!(
            "job {} kind={} status={} attempt={}",
            self.id, self.kind, self.status, self.attempts
        )
    }
}

/// Validate and normalize an idempotency key: trimmed, non-empty, bounded.
pub fn normalize_idempotency_key(raw: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation("idempotency_key must not be empty"));
    }
    if trimmed.len() > IDEMPOTENCY_KEY_MAX_LEN {
        return Err(EngineError::validation(format!(
            "idempotency_key exceeds {IDEMPOTENCY_KEY_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Validate a submitted priority, falling back to the kind default.
pub fn validate_priority(priority: Option<i16>, default: i16) -> Result<i16, EngineError> {
    match priority {
        None => Ok(default),
        Some(p) if (PRIORITY_MIN..=PRIORITY_MAX).contains(&p) => Ok(p),
        Some(p) => Err(EngineError::validation(format!(
            "priority {p} outside {PRIORITY_MIN}..={PRIORITY_MAX}"
        ))),
    }
}
