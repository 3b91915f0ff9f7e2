//! Kind-specific operation capability.
//!
//! Workers execute jobs through the [`JobHandler`] trait; the engine never
//! knows what a `cam` or `sim` operation actually does. Long operations call
//! [`TaskContext::checkpoint`] at safe points (the only legal way to stop
//! mid-task) and report progress through the context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::artefact::ArtefactRef;
use crate::engine::Engine;
use crate::envelope::TaskParams;
use crate::error::EngineError;
use crate::job::{JobId, JobKind};

/// Failures a handler can surface. Cancellation comes from checkpoints;
/// everything else is classified for the retry/DLQ policy.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("cancelled at a checkpoint")]
    Cancelled,
    #[error("transient failure: {message}")]
    Transient { message: String },
    #[error("invalid task input: {message}")]
    Invalid { message: String },
    #[error("{code}: {message}")]
    Failed {
        code: String,
        message: String,
        retryable: bool,
    },
    #[error("fatal handler error: {message}")]
    Fatal { message: String },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient {
            message: message.into(),
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        HandlerError::Failed {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Map into the engine taxonomy for classification and job error records.
    pub fn into_engine_error(self) -> EngineError {
        match self {
            HandlerError::Cancelled => EngineError::Cancelled,
            HandlerError::Transient { message } => EngineError::Transient {
                subsystem: crate::error::Subsystem::ObjectStore,
                message,
            },
            HandlerError::Invalid { message } => EngineError::Validation { message },
            HandlerError::Failed {
                code,
                message,
                retryable,
            } => EngineError::Deterministic {
                code,
                message,
                retryable,
            },
            HandlerError::Fatal { message } => EngineError::Fatal { message },
        }
    }
}

/// Output of a successful run: metadata recorded in the audit trail plus any
/// artefact references produced.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub metadata: serde_json::Value,
    pub artefacts: Vec<ArtefactRef>,
}

impl JobOutput {
    pub fn empty() -> Self {
        Self {
            metadata: serde_json::Value::Null,
            artefacts: Vec::new(),
        }
    }
}

/// Per-task view handed to a handler.
#[derive(Clone)]
pub struct TaskContext {
    engine: Engine,
    job_id: JobId,
    kind: JobKind,
    attempt: i32,
    trace_id: String,
}

impl TaskContext {
    pub(crate) fn new(
        engine: Engine,
        job_id: JobId,
        kind: JobKind,
        attempt: i32,
        trace_id: String,
    ) -> Self {
        Self {
            engine,
            job_id,
            kind,
            attempt,
            trace_id,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Cooperative cancellation checkpoint. Call at safe points; a pending
    /// cancel request surfaces as [`HandlerError::Cancelled`], which the
    /// worker turns into the `cancelled` terminal state.
    pub async fn checkpoint(&self) -> Result<(), HandlerError> {
        match self.engine.check_cancel(self.job_id).await {
            Ok(true) => Err(HandlerError::Cancelled),
            Ok(false) => Ok(()),
            // A flag read that cannot reach the store is transient; the task
            // keeps running and the next checkpoint retries.
            Err(err) => {
                tracing::debug!(job_id = self.job_id, error = %err, "checkpoint read failed");
                Ok(())
            }
        }
    }

    /// Throttled progress report. Reporting failures never abort the task.
    pub async fn report_progress(
        &self,
        percent: i16,
        step: impl Into<String>,
        message: impl Into<String>,
    ) {
        if let Err(err) = self
            .engine
            .report_progress(
                self.job_id,
                percent,
                Some(step.into()),
                Some(message.into()),
            )
            .await
        {
            tracing::warn!(job_id = self.job_id, error = %err, "progress report failed");
        }
    }
}

/// One kind-specific operation.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext, params: TaskParams) -> Result<JobOutput, HandlerError>;
}

/// Kind-to-handler registry a worker process is configured with.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }

    pub fn is_registered(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}
