//! Identifier and token generation.

use rand::RngCore;
use uuid::Uuid;

/// Trace/correlation id: 32 lowercase hex chars, propagated through task
/// envelopes, logs and audit actors.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Broker message id for published task envelopes.
pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Sortable id for operations that benefit from time ordering (replay
/// operations, worker instances).
pub fn new_sortable_id() -> String {
    Uuid::now_v7().to_string()
}

/// Worker instance identity.
pub fn new_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

/// Cryptographically random opaque token, hex-encoded.
pub fn generate_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
