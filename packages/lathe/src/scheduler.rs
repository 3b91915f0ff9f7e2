//! Job status views and queue position.
//!
//! Queue position is computed from the job store with the dispatch ordering:
//! priority strictly precedes enqueue time, ties break on id. Only `queued`
//! jobs have a position.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::artefact::ArtefactRef;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::identity::ActorAssertion;
use crate::job::{Job, JobError, JobId, JobKind, JobStatus};

/// Progress block of the status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressView {
    pub percent: i16,
    pub step: Option<String>,
    pub message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Client-facing job status.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: ProgressView,
    pub attempts: i32,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,
    pub artefacts: Vec<ArtefactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
}

impl JobStatusView {
    /// Weak ETag over the change-relevant fields for cheap polling.
    pub fn weak_etag(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.updated_at.to_rfc3339().as_bytes());
        hasher.update([self.progress.percent as u8]);
        hasher.update(self.status.as_str().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("W/\"{}\"", &digest[..16])
    }

    /// `If-None-Match` support.
    pub fn matches(&self, if_none_match: &str) -> bool {
        if_none_match.trim() == self.weak_etag()
    }
}

impl Engine {
    /// Current status of a job. Unauthorized observers get the same 404 as a
    /// missing job.
    pub async fn job_status(
        &self,
        actor: &ActorAssertion,
        job_id: JobId,
    ) -> Result<JobStatusView, EngineError> {
        let job = self.load_job(job_id).await?;
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

        let queue_position = self.queue_position(&job).await?;
        Ok(JobStatusView {
            id: job.id,
            kind: job.kind,
            status: job.status,
            progress: ProgressView {
                percent: job.progress.percent,
                step: job.progress.step.clone(),
                message: job.progress.message.clone(),
                updated_at: job.progress.updated_at,
            },
            attempts: job.attempts,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            last_error: job.error.clone(),
            artefacts: job.artefacts.clone(),
            queue_position,
        })
    }

    /// Position in the dispatch order of the job's queue, `None` unless the
    /// job is currently `queued`. Position 0 is next in line.
    pub async fn queue_position(&self, job: &Job) -> Result<Option<u64>, EngineError> {
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        Ok(Some(self.store().queued_ahead(job).await?))
    }
}
