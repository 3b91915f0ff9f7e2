//! PostgreSQL job store: atomic admission, optimistic updates, queue
//! position, retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use lathe::error::ConflictKind;
use lathe::job::{Job, JobId, JobKind, JobStatus};
use lathe::store::{Admission, JobStore, NewJob};
use lathe::{ArtefactRef, EngineError, JobError, JobProgress};

use crate::{is_unique_violation, store_err};

const JOB_COLUMNS: &str = "id, owner_id, kind, status, params, idempotency_key, priority, \
     attempts, max_retries, cancel_requested, task_id, trace_id, error, progress, version, \
     created_at, updated_at, enqueued_at, started_at, finished_at";

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn artefacts_for(&self, job_id: JobId) -> Result<Vec<ArtefactRef>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT bucket, object_key, version_id, sha256, size, retention
            FROM artefact_refs
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(artefact_from_row).collect()
    }

    async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => {
                let mut job = job_from_row(&row)?;
                job.artefacts = self.artefacts_for(job.id).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Second look after a unique-violation race: the winner's record decides.
    async fn resolve_claim_race(
        &self,
        new_job: &NewJob,
    ) -> Result<Admission, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT fingerprint, job_id FROM idempotency_records
            WHERE owner_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(new_job.owner)
        .bind(&new_job.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let row = row.ok_or_else(|| {
            EngineError::store("idempotency record vanished after a claim race")
        })?;
        let fingerprint: String = row.try_get("fingerprint").map_err(store_err)?;
        if fingerprint.trim() != new_job.fingerprint {
            return Err(EngineError::Conflict(ConflictKind::Idempotency));
        }
        let job_id: i64 = row.try_get("job_id").map_err(store_err)?;
        let job = self.fetch_job(job_id).await?.ok_or_else(|| {
            EngineError::store("claimed job row missing after a claim race")
        })?;
        Ok(Admission::Duplicate(job))
    }

    async fn write_artefacts(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: JobId,
        artefacts: &[ArtefactRef],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM artefact_refs WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
        for artefact in artefacts {
            sqlx::query(
                r#"
                INSERT INTO artefact_refs (job_id, bucket, object_key, version_id, sha256, size, retention)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job_id)
            .bind(&artefact.bucket)
            .bind(&artefact.object_key)
            .bind(&artefact.version_id)
            .bind(&artefact.sha256)
            .bind(artefact.size)
            .bind(&artefact.retention)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn admit(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Admission, EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let existing = sqlx::query(
            r#"
            SELECT fingerprint, job_id FROM idempotency_records
            WHERE owner_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(new_job.owner)
        .bind(&new_job.idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let mut recreate = false;
        if let Some(row) = existing {
            let fingerprint: String = row.try_get("fingerprint").map_err(store_err)?;
            if fingerprint.trim() != new_job.fingerprint {
                return Err(EngineError::Conflict(ConflictKind::Idempotency));
            }
            let job_id: i64 = row.try_get("job_id").map_err(store_err)?;
            drop(tx);
            match self.fetch_job(job_id).await? {
                Some(job) => return Ok(Admission::Duplicate(job)),
                // The job aged out while its claim record is still inside the
                // idempotency horizon: recreate under the same claim.
                None => {
                    recreate = true;
                    tx = self.pool.begin().await.map_err(store_err)?;
                }
            }
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                owner_id, kind, status, params, idempotency_key, priority,
                attempts, max_retries, cancel_requested, trace_id, progress,
                version, created_at, updated_at
            )
            VALUES ($1, $2, 'pending', $3, $4, $5, 0, $6, FALSE, $7, $8, 1, $9, $9)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(new_job.owner)
        .bind(new_job.kind.as_str())
        .bind(&new_job.params)
        .bind(&new_job.idempotency_key)
        .bind(new_job.priority)
        .bind(new_job.max_retries)
        .bind(&new_job.trace_id)
        .bind(serde_json::to_value(JobProgress::default()).unwrap_or_default())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;
        let job = job_from_row(&row)?;

        let claim = if recreate {
            sqlx::query(
                r#"
                UPDATE idempotency_records
                SET fingerprint = $3, job_id = $4, created_at = $5
                WHERE owner_id = $1 AND idempotency_key = $2
                "#,
            )
            .bind(new_job.owner)
            .bind(&new_job.idempotency_key)
            .bind(&new_job.fingerprint)
            .bind(job.id)
            .bind(now)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                INSERT INTO idempotency_records (owner_id, idempotency_key, fingerprint, job_id, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(new_job.owner)
            .bind(&new_job.idempotency_key)
            .bind(&new_job.fingerprint)
            .bind(job.id)
            .bind(now)
            .execute(&mut *tx)
            .await
        };

        match claim {
            Ok(_) => {
                tx.commit().await.map_err(store_err)?;
                Ok(Admission::Created(job))
            }
            Err(err) if is_unique_violation(&err) => {
                // A concurrent submission inserted the claim first; their job
                // wins and ours rolls back with the transaction.
                drop(tx);
                debug!(
                    owner = new_job.owner,
                    key = %new_job.idempotency_key,
                    "admission lost a claim race, re-reading"
                );
                self.resolve_claim_race(&new_job).await
            }
            Err(err) => Err(store_err(err)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, EngineError> {
        self.fetch_job(id).await
    }

    async fn update(&self, job: &Job) -> Result<Job, EngineError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                status = $3,
                params = $4,
                priority = $5,
                attempts = $6,
                max_retries = $7,
                cancel_requested = jobs.cancel_requested OR $8,
                task_id = $9,
                error = $10,
                progress = $11,
                updated_at = $12,
                enqueued_at = $13,
                started_at = $14,
                finished_at = $15,
                version = jobs.version + 1
            WHERE id = $1 AND version = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(job.version)
        .bind(job.status.as_str())
        .bind(&job.params)
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.cancel_requested)
        .bind(&job.task_id)
        .bind(
            job.error
                .as_ref()
                .map(|e| serde_json::to_value(e).unwrap_or_default()),
        )
        .bind(serde_json::to_value(&job.progress).unwrap_or_default())
        .bind(job.updated_at)
        .bind(job.enqueued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        let row = match row {
            Some(row) => row,
            None => {
                let exists: Option<PgRow> = sqlx::query("SELECT 1 AS one FROM jobs WHERE id = $1")
                    .bind(job.id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(store_err)?;
                return Err(match exists {
                    Some(_) => EngineError::Conflict(ConflictKind::Version),
                    None => EngineError::NotFound {
                        entity: "job",
                        id: job.id.to_string(),
                    },
                });
            }
        };

        Self::write_artefacts(&mut tx, job.id, &job.artefacts)
            .await
            .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        let mut updated = job_from_row(&row)?;
        updated.artefacts = job.artefacts.clone();
        Ok(updated)
    }

    async fn request_cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested = TRUE,
                updated_at = $2,
                version = version + 1
            WHERE id = $1 AND cancel_requested = FALSE
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 AS one FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match exists {
            Some(_) => Ok(false),
            None => Err(EngineError::NotFound {
                entity: "job",
                id: id.to_string(),
            }),
        }
    }

    async fn queued_ahead(&self, job: &Job) -> Result<u64, EngineError> {
        let anchor_time = job.enqueued_at.unwrap_or(job.created_at);
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE kind = $1
              AND status = 'queued'
              AND id <> $2
              AND (
                priority > $3
                OR (priority = $3 AND COALESCE(enqueued_at, created_at) < $4)
                OR (priority = $3 AND COALESCE(enqueued_at, created_at) = $4 AND id < $2)
              )
            "#,
        )
        .bind(job.kind.as_str())
        .bind(job.id)
        .bind(job.priority)
        .bind(anchor_time)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(count as u64)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('succeeded', 'cancelled', 'timeout')
              AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected())
    }

    async fn expire_idempotency_before(&self, cutoff: DateTime<Utc>) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, EngineError> {
    let kind_raw: String = row.try_get("kind").map_err(store_err)?;
    let kind = JobKind::parse(&kind_raw).ok_or_else(|| EngineError::Fatal {
        message: format!("unknown kind '{kind_raw}' in jobs row"),
    })?;
    let status_raw: String = row.try_get("status").map_err(store_err)?;
    let status = parse_status(&status_raw)?;

    let error: Option<serde_json::Value> = row.try_get("error").map_err(store_err)?;
    let error = match error {
        Some(value) => Some(
            serde_json::from_value::<JobError>(value).map_err(|e| EngineError::Fatal {
                message: format!("malformed error column: {e}"),
            })?,
        ),
        None => None,
    };
    let progress: serde_json::Value = row.try_get("progress").map_err(store_err)?;
    let progress =
        serde_json::from_value::<JobProgress>(progress).map_err(|e| EngineError::Fatal {
            message: format!("malformed progress column: {e}"),
        })?;

    Ok(Job {
        id: row.try_get("id").map_err(store_err)?,
        owner: row.try_get("owner_id").map_err(store_err)?,
        kind,
        status,
        params: row.try_get("params").map_err(store_err)?,
        idempotency_key: row.try_get("idempotency_key").map_err(store_err)?,
        priority: row.try_get("priority").map_err(store_err)?,
        attempts: row.try_get("attempts").map_err(store_err)?,
        max_retries: row.try_get("max_retries").map_err(store_err)?,
        cancel_requested: row.try_get("cancel_requested").map_err(store_err)?,
        task_id: row.try_get("task_id").map_err(store_err)?,
        trace_id: row.try_get("trace_id").map_err(store_err)?,
        error,
        progress,
        artefacts: Vec::new(),
        version: row.try_get("version").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
        enqueued_at: row.try_get("enqueued_at").map_err(store_err)?,
        started_at: row.try_get("started_at").map_err(store_err)?,
        finished_at: row.try_get("finished_at").map_err(store_err)?,
    })
}

fn artefact_from_row(row: &PgRow) -> Result<ArtefactRef, EngineError> {
    let sha256: String = row.try_get("sha256").map_err(store_err)?;
    Ok(ArtefactRef {
        bucket: row.try_get("bucket").map_err(store_err)?,
        object_key: row.try_get("object_key").map_err(store_err)?,
        version_id: row.try_get("version_id").map_err(store_err)?,
        sha256: sha256.trim().to_string(),
        size: row.try_get("size").map_err(store_err)?,
        retention: row.try_get("retention").map_err(store_err)?,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, EngineError> {
    Ok(match raw {
        "pending" => JobStatus::Pending,
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "succeeded" => JobStatus::Succeeded,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        "timeout" => JobStatus::Timeout,
        other => {
            return Err(EngineError::Fatal {
                message: format!("unknown status '{other}' in jobs row"),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_covers_the_state_machine() {
        for status in [
            JobStatus::Pending,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Timeout,
        ] {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
        assert!(parse_status("zombie").is_err());
    }

    #[test]
    fn job_columns_list_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for column in JOB_COLUMNS.split(',').map(str::trim) {
            assert!(seen.insert(column.to_string()), "duplicate column {column}");
        }
        assert_eq!(seen.len(), 20);
    }
}
