//! The engine value: one handle holding every collaborator interface.
//!
//! No process-wide mutable state. Construct one `Engine` from its
//! dependencies and pass it explicitly to intake handlers, workers and
//! operator tooling. Cloning is cheap (shared inner).

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tracing::{error, info};

use crate::artefact::ObjectStore;
use crate::audit::{AuditChain, AuditScope, AuditStore, ChainVerification};
use crate::broker::Broker;
use crate::cancel::Cache;
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::identity::Identity;
use crate::job::{Job, JobError, JobId, JobKind, JobStatus};
use crate::progress::ProgressThrottle;
use crate::rate_limit::IntakeLimiter;
use crate::routing::{KindPolicy, RoutingTable};
use crate::store::JobStore;
use crate::topology::Topology;

/// Collaborator interfaces the engine is constructed from.
pub struct EngineDeps {
    pub clock: SharedClock,
    pub store: Arc<dyn JobStore>,
    pub audit_store: Arc<dyn AuditStore>,
    pub broker: Arc<dyn Broker>,
    pub cache: Arc<dyn Cache>,
    pub identity: Arc<dyn Identity>,
    pub object_store: Arc<dyn ObjectStore>,
}

pub(crate) struct EngineInner {
    pub(crate) clock: SharedClock,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) audit: AuditChain,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) identity: Arc<dyn Identity>,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) routing: RoutingTable,
    pub(crate) config: EngineConfig,
    pub(crate) limiter: IntakeLimiter,
    pub(crate) progress: ProgressThrottle,
}

/// The job lifecycle engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        deps: EngineDeps,
        routing: RoutingTable,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let config = config.validated()?;
        let limiter = IntakeLimiter::new(config.global_rps, config.per_owner_rps)?;
        let audit = AuditChain::new(
            deps.audit_store,
            deps.clock.clone(),
            config.audit_append_max_attempts,
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                clock: deps.clock,
                store: deps.store,
                audit,
                broker: deps.broker,
                cache: deps.cache,
                identity: deps.identity,
                object_store: deps.object_store,
                routing,
                config,
                limiter,
                progress: ProgressThrottle::new(),
            }),
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn audit(&self) -> &AuditChain {
        &self.inner.audit
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.inner.cache
    }

    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.inner.identity
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.inner.object_store
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn limiter(&self) -> &IntakeLimiter {
        &self.inner.limiter
    }

    pub(crate) fn progress_throttle(&self) -> &ProgressThrottle {
        &self.inner.progress
    }

    pub(crate) fn policy(&self, kind: JobKind) -> &KindPolicy {
        self.inner.routing.policy(kind)
    }

    /// The declared topology for this engine's routing table.
    pub fn topology(&self) -> Topology {
        Topology::standard(&self.inner.routing, &self.inner.config.topology)
    }

    /// Reconcile exchanges, queues and bindings with the broker. Idempotent;
    /// run on startup and on demand.
    pub async fn ensure_topology(&self) -> Result<(), EngineError> {
        let topology = self.topology();
        self.inner.broker.declare(&topology).await?;
        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "queue topology reconciled"
        );
        Ok(())
    }

    /// Load a job or surface `NotFound`.
    pub(crate) async fn load_job(&self, id: JobId) -> Result<Job, EngineError> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "job",
                id: id.to_string(),
            })
    }

    /// Apply a state transition and append its audit event.
    ///
    /// The store update is guarded by the job's optimistic version. A failed
    /// audit append blocks the transition from the caller's perspective: the
    /// job is quarantined with a fatal error and the caller sees `Fatal`.
    pub(crate) async fn transition_with_audit(
        &self,
        job: &mut Job,
        to: JobStatus,
        event_type: &str,
        payload: serde_json::Value,
        actor: Option<String>,
    ) -> Result<(), EngineError> {
        let now = self.inner.clock.now();
        job.transition(to, now)?;
        *job = self.inner.store.update(job).await?;
        metrics::counter!("lathe_job_transitions_total", "to" => to.as_str()).increment(1);

        match self
            .inner
            .audit
            .append(AuditScope::job(job.id), event_type, payload, actor)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(
                    job_id = job.id,
                    event_type,
                    error = %err,
                    "audit append failed, quarantining job"
                );
                job.error = Some(JobError {
                    code: "AUDIT_APPEND_FAILED".to_string(),
                    message: "state transition could not be audited".to_string(),
                    retryable: false,
                });
                if let Err(update_err) = self.inner.store.update(job).await {
                    error!(job_id = job.id, error = %update_err, "quarantine write failed");
                }
                Err(EngineError::Fatal {
                    message: format!("audit append for job {} failed: {err}", job.id),
                })
            }
        }
    }

    /// Verify the audit chain of one job.
    pub async fn verify_job_audit(&self, job_id: JobId) -> Result<ChainVerification, EngineError> {
        self.inner.audit.verify(&AuditScope::job(job_id)).await
    }

    /// Apply the retention policy: purge terminal jobs and expired
    /// idempotency records.
    pub async fn run_retention(&self) -> Result<RetentionReport, EngineError> {
        let now = self.inner.clock.now();
        let job_cutoff = now - Duration::days(self.inner.config.job_retention_days);
        let idem_cutoff = now - Duration::days(self.inner.config.idempotency_retention_days);

        let jobs_purged = self.inner.store.purge_terminal_before(job_cutoff).await?;
        let idempotency_expired = self
            .inner
            .store
            .expire_idempotency_before(idem_cutoff)
            .await?;

        if jobs_purged > 0 || idempotency_expired > 0 {
            info!(jobs_purged, idempotency_expired, "retention pass completed");
        }
        Ok(RetentionReport {
            jobs_purged,
            idempotency_expired,
        })
    }

    /// Payload for a lifecycle audit event, shared by the transition sites.
    pub(crate) fn audit_payload_for(&self, job: &Job, extra: serde_json::Value) -> serde_json::Value {
        let mut payload = json!({
            "job_kind": job.kind.as_str(),
            "status": job.status.as_str(),
            "attempt": job.attempts,
            "trace_id": job.trace_id,
        });
        if let (Some(base), Some(extra_map)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                base.insert(k.clone(), v.clone());
            }
        }
        payload
    }
}

/// Result of one retention pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub jobs_purged: u64,
    pub idempotency_expired: u64,
}
