//! Rate-limited progress reporting.
//!
//! Reports are monotonic (a percent below the stored value is dropped) and
//! persisted at most once per job per throttle interval; intermediate reports
//! coalesce into the next persisted write. Terminal transitions write their
//! final progress directly and bypass the throttle.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{ConflictKind, EngineError};
use crate::job::{JobId, JobProgress};

/// Bounded lengths for the step/message strings kept on the job row.
const MAX_STEP_CHARS: usize = 64;
const MAX_MESSAGE_CHARS: usize = 256;

/// What happened to one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Persisted,
    /// Inside the throttle window; coalesced into a later write.
    Throttled,
    /// Below the stored percent; monotonicity dropped it.
    DroppedMonotonic,
    /// The job already reached a settled state.
    DroppedSettled,
}

/// Per-job record of the last persisted write instant.
pub(crate) struct ProgressThrottle {
    last_persist: DashMap<JobId, DateTime<Utc>>,
}

impl ProgressThrottle {
    pub(crate) fn new() -> Self {
        Self {
            last_persist: DashMap::new(),
        }
    }

    fn should_persist(&self, job_id: JobId, now: DateTime<Utc>, interval_ms: u64) -> bool {
        match self.last_persist.get(&job_id) {
            Some(last) => now - *last >= Duration::milliseconds(interval_ms as i64),
            None => true,
        }
    }

    fn mark_persisted(&self, job_id: JobId, now: DateTime<Utc>) {
        self.last_persist.insert(job_id, now);
    }

    pub(crate) fn forget(&self, job_id: JobId) {
        self.last_persist.remove(&job_id);
    }
}

fn bounded(value: Option<String>, max_chars: usize) -> Option<String> {
    value.map(|s| {
        if s.chars().count() <= max_chars {
            s
        } else {
            s.chars().take(max_chars).collect()
        }
    })
}

impl Engine {
    /// Record a progress report for a job.
    pub async fn report_progress(
        &self,
        job_id: JobId,
        percent: i16,
        step: Option<String>,
        message: Option<String>,
    ) -> Result<ProgressOutcome, EngineError> {
        if !(0..=100).contains(&percent) {
            return Err(EngineError::validation(format!(
                "progress percent {percent} outside 0..=100"
            )));
        }

        let mut job = self.load_job(job_id).await?;
        if job.status.is_settled() {
            return Ok(ProgressOutcome::DroppedSettled);
        }
        if percent < job.progress.percent {
            metrics::counter!("lathe_progress_dropped_total", "reason" => "monotonic").increment(1);
            return Ok(ProgressOutcome::DroppedMonotonic);
        }

        let now = self.clock().now();
        let interval = self.policy(job.kind).progress_throttle_ms;
        if !self.progress_throttle().should_persist(job_id, now, interval) {
            metrics::counter!("lathe_progress_throttled_total").increment(1);
            return Ok(ProgressOutcome::Throttled);
        }

        let progress = JobProgress {
            percent,
            step: bounded(step, MAX_STEP_CHARS),
            message: bounded(message, MAX_MESSAGE_CHARS),
            updated_at: Some(now),
        };

        job.progress = progress.clone();
        job.updated_at = now;
        match self.store().update(&job).await {
            Ok(stored) => {
                job = stored;
            }
            Err(EngineError::Conflict(ConflictKind::Version)) => {
                // The row moved under us (cancel flag, transition). Reload and
                // re-apply once; a second conflict drops the report.
                let mut fresh = self.load_job(job_id).await?;
                if fresh.status.is_settled() || progress.percent < fresh.progress.percent {
                    return Ok(ProgressOutcome::DroppedSettled);
                }
                fresh.progress = progress;
                fresh.updated_at = now;
                match self.store().update(&fresh).await {
                    Ok(_) => {}
                    Err(EngineError::Conflict(ConflictKind::Version)) => {
                        debug!(job_id, "progress write lost two version races, dropping");
                        return Ok(ProgressOutcome::Throttled);
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }

        self.progress_throttle().mark_persisted(job_id, now);
        metrics::counter!("lathe_progress_persisted_total").increment(1);
        debug!(job_id, percent, step = ?job.progress.step, "progress persisted");
        Ok(ProgressOutcome::Persisted)
    }
}
