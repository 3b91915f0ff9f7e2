//! PostgreSQL audit store: append-only with `(scope_kind, scope_id, seq)`
//! uniqueness arbitrating concurrent appends.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use lathe::audit::{AuditAppendError, AuditEvent, AuditScope, AuditStore, ChainHead};
use lathe::EngineError;

use crate::{is_unique_violation, store_err};

pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn head(&self, scope: &AuditScope) -> Result<Option<ChainHead>, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT seq, chain_hash FROM audit_events
            WHERE scope_kind = $1 AND scope_id = $2
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(&scope.kind)
        .bind(scope.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => {
                let chain_hash: String = row.try_get("chain_hash").map_err(store_err)?;
                Ok(Some(ChainHead {
                    seq: row.try_get("seq").map_err(store_err)?,
                    chain_hash: chain_hash.trim().to_string(),
                }))
            }
            None => Ok(None),
        }
    }

    async fn insert(&self, event: &AuditEvent) -> Result<(), AuditAppendError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_events (
                scope_kind, scope_id, seq, event_type, payload,
                prev_hash, chain_hash, actor, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&event.scope.kind)
        .bind(event.scope.id)
        .bind(event.seq)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.prev_hash)
        .bind(&event.chain_hash)
        .bind(&event.actor)
        .bind(event.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(AuditAppendError::SequenceConflict),
            Err(err) => Err(AuditAppendError::Storage(store_err(err))),
        }
    }

    async fn list(&self, scope: &AuditScope) -> Result<Vec<AuditEvent>, EngineError> {
        let rows = sqlx::query(
            r#"
            SELECT scope_kind, scope_id, seq, event_type, payload,
                   prev_hash, chain_hash, actor, created_at
            FROM audit_events
            WHERE scope_kind = $1 AND scope_id = $2
            ORDER BY seq
            "#,
        )
        .bind(&scope.kind)
        .bind(scope.id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: &PgRow) -> Result<AuditEvent, EngineError> {
    let prev_hash: String = row.try_get("prev_hash").map_err(store_err)?;
    let chain_hash: String = row.try_get("chain_hash").map_err(store_err)?;
    Ok(AuditEvent {
        scope: AuditScope {
            kind: row.try_get("scope_kind").map_err(store_err)?,
            id: row.try_get("scope_id").map_err(store_err)?,
        },
        seq: row.try_get("seq").map_err(store_err)?,
        event_type: row.try_get("event_type").map_err(store_err)?,
        payload: row.try_get("payload").map_err(store_err)?,
        prev_hash: prev_hash.trim().to_string(),
        chain_hash: chain_hash.trim().to_string(),
        actor: row.try_get("actor").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
    })
}
