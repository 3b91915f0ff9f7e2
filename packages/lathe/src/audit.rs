//! Append-only, hash-chained audit log.
//!
//! Every state transition appends one event to the chain of its scope
//! (`job:<id>`, `queue:<ordinal>`). Events link by SHA-256:
//!
//! ```text
//! chain_hash = SHA256(prev_hash || canonical(payload) || scope || event_type || seq)
//! ```
//!
//! where `prev_hash` is the previous event's `chain_hash` as lowercase hex,
//! `scope` is the `kind:id` form, and `seq` is the decimal sequence number.
//! The genesis event links to 64 zeros. The verifier recomputes the chain and
//! reports the index of the first violation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, warn};

use crate::canonical::canonical_string;
use crate::clock::SharedClock;
use crate::error::EngineError;
use crate::job::{JobId, JobKind};

/// `prev_hash` of the first event in every scope.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Lifecycle event types appended by the engine.
pub mod event_types {
    pub const CREATED: &str = "created";
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const SUCCEEDED: &str = "succeeded";
    pub const RETRYING: &str = "retrying";
    pub const FAILED: &str = "failed";
    pub const CANCEL_REQUESTED: &str = "cancel_requested";
    pub const CANCELLED: &str = "cancelled";
    pub const TIMEOUT: &str = "timeout";
    pub const DLQ_REPLAYED: &str = "dlq_replayed";
    pub const DLQ_PURGED: &str = "dlq_purged";
}

/// Chain scope: one chain per `(entity kind, entity id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditScope {
    pub kind: String,
    pub id: i64,
}

impl AuditScope {
    pub fn job(id: JobId) -> Self {
        Self {
            kind: "job".to_string(),
            id,
        }
    }

    pub fn queue(kind: JobKind) -> Self {
        Self {
            kind: "queue".to_string(),
            id: kind.ordinal(),
        }
    }
}

impl fmt::Display for AuditScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// One immutable audit chain entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub scope: AuditScope,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub chain_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Head of a chain, what the next append links to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub seq: i64,
    pub chain_hash: String,
}

/// Compute the chained hash for one event.
pub fn compute_chain_hash(
    prev_hash: &str,
    payload: &serde_json::Value,
    scope: &AuditScope,
    event_type: &str,
    seq: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_string(payload).as_bytes());
    hasher.update(scope.to_string().as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(seq.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Append failure split so the chain service can retry sequence races.
#[derive(Debug, Error)]
pub enum AuditAppendError {
    /// Another writer claimed the sequence number first.
    #[error("audit sequence conflict")]
    SequenceConflict,
    #[error(transparent)]
    Storage(EngineError),
}

/// Persistence contract for audit events.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Current head of a scope's chain, `None` for an empty scope.
    async fn head(&self, scope: &AuditScope) -> Result<Option<ChainHead>, EngineError>;

    /// Insert one event. Must enforce `(scope, seq)` uniqueness atomically and
    /// return [`AuditAppendError::SequenceConflict`] when violated.
    async fn insert(&self, event: &AuditEvent) -> Result<(), AuditAppendError>;

    /// Events of a scope in sequence order.
    async fn list(&self, scope: &AuditScope) -> Result<Vec<AuditEvent>, EngineError>;
}

/// Result of a chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerification {
    Valid { events: usize },
    Violation { index: usize, reason: String },
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainVerification::Valid { .. })
    }

    /// Index of the first violating event, if any.
    pub fn violation_index(&self) -> Option<usize> {
        match self {
            ChainVerification::Valid { .. } => None,
            ChainVerification::Violation { index, .. } => Some(*index),
        }
    }
}

/// Appender/verifier over an [`AuditStore`].
#[derive(Clone)]
pub struct AuditChain {
    store: Arc<dyn AuditStore>,
    clock: SharedClock,
    max_append_attempts: u32,
}

impl AuditChain {
    pub fn new(store: Arc<dyn AuditStore>, clock: SharedClock, max_append_attempts: u32) -> Self {
        Self {
            store,
            clock,
            max_append_attempts: max_append_attempts.max(1),
        }
    }

    /// Append one event, retrying sequence races against concurrent writers.
    ///
    /// Storage failures propagate to the caller: an audit append that cannot
    /// be persisted must block the state transition it accompanies.
    pub async fn append(
        &self,
        scope: AuditScope,
        event_type: &str,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> Result<AuditEvent, EngineError> {
        for attempt in 1..=self.max_append_attempts {
            let head = self.store.head(&scope).await?;
            let (seq, prev_hash) = match &head {
                Some(head) => (head.seq + 1, head.chain_hash.clone()),
                None => (1, GENESIS_PREV_HASH.to_string()),
            };
            let chain_hash = compute_chain_hash(&prev_hash, &payload, &scope, event_type, seq);
            let event = AuditEvent {
                scope: scope.clone(),
                seq,
                event_type: event_type.to_string(),
                payload: payload.clone(),
                prev_hash,
                chain_hash,
                actor: actor.clone(),
                created_at: self.clock.now(),
            };

            match self.store.insert(&event).await {
                Ok(()) => return Ok(event),
                Err(AuditAppendError::SequenceConflict) => {
                    warn!(
                        scope = %event.scope,
                        seq = event.seq,
                        attempt,
                        "audit sequence conflict, re-reading head"
                    );
                    continue;
                }
                Err(AuditAppendError::Storage(err)) => return Err(err),
            }
        }

        error!(scope = %scope, event_type, "audit append exhausted its retries");
        Err(EngineError::Fatal {
            message: format!("audit append for {scope} kept losing sequence races"),
        })
    }

    /// Scan a scope and verify every link. Returns the index of the first
    /// violating event (0-based over the listed order).
    pub async fn verify(&self, scope: &AuditScope) -> Result<ChainVerification, EngineError> {
        let events = self.store.list(scope).await?;
        let mut prev_hash = GENESIS_PREV_HASH.to_string();
        let mut prev_seq = 0_i64;

        for (index, event) in events.iter().enumerate() {
            if event.seq != prev_seq + 1 {
                return Ok(ChainVerification::Violation {
                    index,
                    reason: format!("sequence gap: expected {}, found {}", prev_seq + 1, event.seq),
                });
            }
            if event.prev_hash != prev_hash {
                return Ok(ChainVerification::Violation {
                    index,
                    reason: "prev_hash mismatch".to_string(),
                });
            }
            let expected = compute_chain_hash(
                &event.prev_hash,
                &event.payload,
                &event.scope,
                &event.event_type,
                event.seq,
            );
            if event.chain_hash != expected {
                return Ok(ChainVerification::Violation {
                    index,
                    reason: "chain_hash mismatch".to_string(),
                });
            }
            prev_hash = event.chain_hash.clone();
            prev_seq = event.seq;
        }

        Ok(ChainVerification::Valid {
            events: events.len(),
        })
    }

    /// Ordered event types for a scope, primarily for assertions and
    /// operator tooling.
    pub async fn trail(&self, scope: &AuditScope) -> Result<Vec<String>, EngineError> {
        Ok(self
            .store
            .list(scope)
            .await?
            .into_iter()
            .map(|e| e.event_type)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_hash_is_deterministic() {
        let scope = AuditScope::job(123);
        let payload = json!({"job_type": "model", "priority": 1});
        let a = compute_chain_hash(GENESIS_PREV_HASH, &payload, &scope, "created", 1);
        let b = compute_chain_hash(GENESIS_PREV_HASH, &payload, &scope, "created", 1);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn chain_hash_varies_with_every_input() {
        let scope = AuditScope::job(123);
        let payload = json!({"priority": 1});
        let base = compute_chain_hash(GENESIS_PREV_HASH, &payload, &scope, "created", 1);

        let other_scope = AuditScope::job(124);
        assert_ne!(
            base,
            compute_chain_hash(GENESIS_PREV_HASH, &payload, &other_scope, "created", 1)
        );
        assert_ne!(
            base,
            compute_chain_hash(GENESIS_PREV_HASH, &payload, &scope, "queued", 1)
        );
        assert_ne!(
            base,
            compute_chain_hash(GENESIS_PREV_HASH, &payload, &scope, "created", 2)
        );
        assert_ne!(
            base,
            compute_chain_hash(GENESIS_PREV_HASH, &json!({"priority": 2}), &scope, "created", 1)
        );
    }

    #[test]
    fn payload_key_order_does_not_change_the_hash() {
        let scope = AuditScope::job(9);
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(
            compute_chain_hash(GENESIS_PREV_HASH, &a, &scope, "created", 1),
            compute_chain_hash(GENESIS_PREV_HASH, &b, &scope, "created", 1)
        );
    }

    #[test]
    fn scope_display_is_kind_colon_id() {
        assert_eq!(AuditScope::job(42).to_string(), "job:42");
        assert_eq!(AuditScope::queue(JobKind::Model).to_string(), "queue:1");
    }
}
