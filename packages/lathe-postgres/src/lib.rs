//! PostgreSQL implementations of the lathe store contracts.
//!
//! Two concurrency primitives back the engine guarantees, exactly as the
//! traits demand: the `(owner_id, idempotency_key)` primary key arbitrates
//! admission claims, and `UPDATE ... WHERE id = $1 AND version = $2` arbitrates
//! state transitions. No advisory locks, no `SELECT ... FOR UPDATE` on the
//! hot paths.
//!
//! Run [`MIGRATOR`] against the pool before constructing the stores:
//!
//! ```ignore
//! let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
//! lathe_postgres::MIGRATOR.run(&pool).await?;
//! let store = PgJobStore::new(pool.clone());
//! let audit = PgAuditStore::new(pool);
//! ```

mod audit_store;
mod job_store;

pub use audit_store::PgAuditStore;
pub use job_store::PgJobStore;

/// Embedded SQL migrations for the §6.7 state layout.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

use lathe::EngineError;

/// Map a driver error to the transient store taxonomy.
pub(crate) fn store_err(err: sqlx::Error) -> EngineError {
    EngineError::Transient {
        subsystem: lathe::Subsystem::Store,
        message: err.to_string(),
    }
}

/// Unique-constraint violation, the only storage error the claim paths treat
/// specially.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}
