//! Integration tests against a live PostgreSQL. Run with:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/lathe_test cargo test -p lathe-postgres -- --ignored
//! ```

use chrono::Utc;
use serde_json::json;

use lathe::audit::{AuditChain, AuditScope};
use lathe::clock::SystemClock;
use lathe::error::ConflictKind;
use lathe::job::{JobKind, JobStatus};
use lathe::store::{JobStore, NewJob};
use lathe::EngineError;
use lathe_postgres::{PgAuditStore, PgJobStore, MIGRATOR};

use std::sync::Arc;

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect to test database");
    MIGRATOR.run(&pool).await.expect("run migrations");
    pool
}

fn new_job(owner: i64, key: &str, fingerprint: &str) -> NewJob {
    NewJob {
        owner,
        kind: JobKind::Model,
        params: json!({"l": 10, "w": 5}),
        idempotency_key: key.to_string(),
        fingerprint: fingerprint.to_string(),
        priority: 5,
        max_retries: 3,
        trace_id: "f".repeat(32),
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn admission_claim_and_duplicate_round_trip() {
    let store = PgJobStore::new(pool().await);
    let key = format!("it-{}", uuid_like());
    let fingerprint = "a".repeat(64);

    let first = store
        .admit(new_job(42, &key, &fingerprint), Utc::now())
        .await
        .unwrap();
    assert!(first.is_created());
    assert_eq!(first.job().status, JobStatus::Pending);

    let second = store
        .admit(new_job(42, &key, &fingerprint), Utc::now())
        .await
        .unwrap();
    assert!(!second.is_created());
    assert_eq!(second.job().id, first.job().id);

    let conflict = store
        .admit(new_job(42, &key, &"b".repeat(64)), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        conflict,
        EngineError::Conflict(ConflictKind::Idempotency)
    ));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn optimistic_update_rejects_stale_writers() {
    let store = PgJobStore::new(pool().await);
    let key = format!("it-{}", uuid_like());
    let admitted = store
        .admit(new_job(7, &key, &"c".repeat(64)), Utc::now())
        .await
        .unwrap();
    let mut job = admitted.job().clone();

    job.transition(JobStatus::Queued, Utc::now()).unwrap();
    let stored = store.update(&job).await.unwrap();
    assert_eq!(stored.version, job.version + 1);
    assert_eq!(stored.status, JobStatus::Queued);

    // The pre-update snapshot is now stale.
    let err = store.update(&job).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(ConflictKind::Version)));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn audit_chain_appends_and_verifies_through_postgres() {
    let pg = pool().await;
    let chain = AuditChain::new(Arc::new(PgAuditStore::new(pg)), Arc::new(SystemClock), 8);
    let scope = AuditScope {
        kind: "job".to_string(),
        id: rand_scope_id(),
    };

    chain
        .append(scope.clone(), "created", json!({"priority": 5}), None)
        .await
        .unwrap();
    chain
        .append(scope.clone(), "queued", json!({"queue": "q.model"}), None)
        .await
        .unwrap();

    let verification = chain.verify(&scope).await.unwrap();
    assert!(verification.is_valid());
    assert_eq!(chain.trail(&scope).await.unwrap(), vec!["created", "queued"]);
}

fn uuid_like() -> String {
    lathe::ids::new_trace_id()
}

fn rand_scope_id() -> i64 {
    (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        % i64::MAX as u128) as i64
}
