//! Structured error taxonomy for the job lifecycle engine.
//!
//! `EngineError` is the only error type that crosses the engine API boundary.
//! Every variant carries a stable machine-readable code and maps to a retry
//! classification (`ErrorClass`) that the worker and the retry/DLQ handler act
//! on. `anyhow` stays internal to handlers and binaries.

use std::fmt;

use thiserror::Error;

use crate::job::JobStatus;

/// Which collaborator a transient failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Store,
    Broker,
    Cache,
    ObjectStore,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subsystem::Store => write!(f, "store"),
            Subsystem::Broker => write!(f, "broker"),
            Subsystem::Cache => write!(f, "cache"),
            Subsystem::ObjectStore => write!(f, "object_store"),
        }
    }
}

/// Conflict sub-kinds. Idempotency mismatches and state-machine violations
/// both surface as 409-style conflicts but need distinct codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("idempotency key reused with a different payload")]
    Idempotency,
    #[error("illegal transition {from} -> {to}")]
    State { from: JobStatus, to: JobStatus },
    #[error("stale version, row was updated concurrently")]
    Version,
}

/// The engine-wide error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("unauthenticated request")]
    Unauthorized,

    #[error("actor is not allowed to perform this operation")]
    Forbidden,

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(ConflictKind),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("transient {subsystem} failure: {message}")]
    Transient { subsystem: Subsystem, message: String },

    #[error("{code}: {message}")]
    Deterministic {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline of {budget_ms} ms exceeded")]
    Timeout { budget_ms: u64 },

    #[error("fatal invariant violation: {message}")]
    Fatal { message: String },
}

/// Retry classification used by the worker and the retry/DLQ handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broker/storage/cache unavailability. Retried up to the kind budget.
    Transient,
    /// Invalid input, policy denial. Never retried, dead-lettered immediately.
    User,
    /// Kind-specific operation failure; retried only when flagged retryable.
    Deterministic { retryable: bool },
    /// Cooperative cancellation. Never retried, never dead-lettered.
    Cancelled,
    /// Worker deadline exceeded.
    Timeout,
    /// Internal invariant violation. Dead-lettered immediately.
    Fatal,
}

impl EngineError {
    /// Stable machine-readable code, safe to surface to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "VALIDATION",
            EngineError::Unauthorized => "UNAUTHORIZED",
            EngineError::Forbidden => "FORBIDDEN",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Conflict(ConflictKind::Idempotency) => "IDEMPOTENCY_CONFLICT",
            EngineError::Conflict(ConflictKind::State { .. }) => "STATE_CONFLICT",
            EngineError::Conflict(ConflictKind::Version) => "VERSION_CONFLICT",
            EngineError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            EngineError::RateLimited => "RATE_LIMITED",
            EngineError::Transient { .. } => "TRANSIENT",
            EngineError::Deterministic { .. } => "OPERATION_FAILED",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Timeout { .. } => "TIMEOUT",
            EngineError::Fatal { .. } => "FATAL",
        }
    }

    /// Classification for the retry/DLQ routing policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Transient { .. } => ErrorClass::Transient,
            EngineError::Validation { .. }
            | EngineError::Unauthorized
            | EngineError::Forbidden
            | EngineError::NotFound { .. }
            | EngineError::Conflict(_)
            | EngineError::PayloadTooLarge { .. }
            | EngineError::RateLimited => ErrorClass::User,
            EngineError::Deterministic { retryable, .. } => ErrorClass::Deterministic {
                retryable: *retryable,
            },
            EngineError::Cancelled => ErrorClass::Cancelled,
            EngineError::Timeout { .. } => ErrorClass::Timeout,
            EngineError::Fatal { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Deterministic { retryable: true }
        )
    }

    /// Transport status mapping for the dispatcher at the edge.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation { .. } => 422,
            EngineError::Unauthorized => 401,
            EngineError::Forbidden => 403,
            EngineError::NotFound { .. } => 404,
            EngineError::Conflict(_) => 409,
            EngineError::PayloadTooLarge { .. } => 413,
            EngineError::RateLimited => 429,
            EngineError::Transient { .. } => 503,
            EngineError::Deterministic { .. } => 422,
            EngineError::Cancelled => 409,
            EngineError::Timeout { .. } => 504,
            EngineError::Fatal { .. } => 500,
        }
    }

    /// English human-readable message. Never leaks internal details for
    /// non-user-facing kinds.
    pub fn message_en(&self) -> String {
        match self {
            EngineError::Validation { message } => format!("Invalid request: {message}"),
            EngineError::Unauthorized => "Authentication is required.".to_string(),
            EngineError::Forbidden => "You are not allowed to perform this operation.".to_string(),
            EngineError::NotFound { entity, .. } => format!("The requested {entity} was not found."),
            EngineError::Conflict(kind) => format!("Conflict: {kind}."),
            EngineError::PayloadTooLarge { limit, .. } => {
                format!("The payload exceeds the {limit} byte limit.")
            }
            EngineError::RateLimited => {
                "Too many requests, please retry shortly.".to_string()
            }
            EngineError::Transient { .. } => {
                "A backing service is temporarily unavailable, please retry.".to_string()
            }
            EngineError::Deterministic { message, .. } => format!("Operation failed: {message}"),
            EngineError::Cancelled => "The job was cancelled.".to_string(),
            EngineError::Timeout { .. } => "The job exceeded its time budget.".to_string(),
            EngineError::Fatal { .. } => "An internal error occurred.".to_string(),
        }
    }

    /// Turkish human-readable message, paired with [`EngineError::message_en`].
    pub fn message_tr(&self) -> String {
        match self {
            EngineError::Validation { message } => format!("Geçersiz istek: {message}"),
            EngineError::Unauthorized => "Kimlik doğrulaması gerekli.".to_string(),
            EngineError::Forbidden => "Bu işlem için yetkiniz yok.".to_string(),
            EngineError::NotFound { entity, .. } => format!("İstenen {entity} bulunamadı."),
            EngineError::Conflict(_) => "İstek mevcut durumla çakışıyor.".to_string(),
            EngineError::PayloadTooLarge { limit, .. } => {
                format!("İstek gövdesi {limit} bayt sınırını aşıyor.")
            }
            EngineError::RateLimited => {
                "Çok fazla istek gönderildi, lütfen biraz sonra tekrar deneyin.".to_string()
            }
            EngineError::Transient { .. } => {
                "Bir arka plan servisi geçici olarak kullanılamıyor, lütfen tekrar deneyin."
                    .to_string()
            }
            EngineError::Deterministic { message, .. } => format!("İşlem başarısız: {message}"),
            EngineError::Cancelled => "İş iptal edildi.".to_string(),
            EngineError::Timeout { .. } => "İş zaman bütçesini aştı.".to_string(),
            EngineError::Fatal { .. } => "Dahili bir hata oluştu.".to_string(),
        }
    }

    /// Convenience constructor for transient store failures.
    pub fn store(message: impl Into<String>) -> Self {
        EngineError::Transient {
            subsystem: Subsystem::Store,
            message: message.into(),
        }
    }

    /// Convenience constructor for transient broker failures.
    pub fn broker(message: impl Into<String>) -> Self {
        EngineError::Transient {
            subsystem: Subsystem::Broker,
            message: message.into(),
        }
    }

    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation {
            message: message.into(),
        }
    }
}
