//! Routing table: job kind to queue, routing key and per-kind policy.
//!
//! Physical naming lives here and in the topology module only; nothing built
//! from user input ever becomes a routing key.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::job::JobKind;

/// Primary direct exchange receiving all fresh tasks.
pub const JOBS_EXCHANGE: &str = "jobs.direct";

/// Dead-letter routing key; DLQs bind with the same wildcard.
pub const DEAD_LETTER_ROUTING_KEY: &str = "#";

pub fn queue_name(kind: JobKind) -> String {
    format!("q.{kind}")
}

pub fn routing_key(kind: JobKind) -> String {
    format!("jobs.{kind}")
}

pub fn dlx_name(kind: JobKind) -> String {
    format!("q.{kind}.dlx")
}

pub fn dlq_name(kind: JobKind) -> String {
    format!("q.{kind}.dlq")
}

/// Per-kind execution and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindPolicy {
    pub max_retries: i32,
    pub base_backoff_ms: u64,
    pub cap_backoff_ms: u64,
    /// Worker-enforced wall-clock budget per attempt.
    pub wall_clock_ms: u64,
    /// Broker-side message TTL for the primary queue.
    pub message_ttl_ms: u64,
    /// Default submission priority when the caller does not pick one.
    pub default_priority: i16,
    /// Progress persistence throttle.
    pub progress_throttle_ms: u64,
}

/// Kind-to-policy mapping. Values follow the production queue definitions:
/// modelling kinds get an hour-scale budget and three retries, reporting and
/// ERP sync are shorter-lived with two.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    policies: HashMap<JobKind, KindPolicy>,
}

impl RoutingTable {
    pub fn standard() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            JobKind::Ai,
            KindPolicy {
                max_retries: 3,
                base_backoff_ms: 200,
                cap_backoff_ms: 5_000,
                wall_clock_ms: 1_800_000,
                message_ttl_ms: 1_800_000,
                default_priority: 5,
                progress_throttle_ms: 100,
            },
        );
        policies.insert(
            JobKind::Model,
            KindPolicy {
                max_retries: 3,
                base_backoff_ms: 200,
                cap_backoff_ms: 5_000,
                wall_clock_ms: 3_600_000,
                message_ttl_ms: 3_600_000,
                default_priority: 7,
                progress_throttle_ms: 100,
            },
        );
        policies.insert(
            JobKind::Cam,
            KindPolicy {
                max_retries: 3,
                base_backoff_ms: 200,
                cap_backoff_ms: 5_000,
                wall_clock_ms: 2_700_000,
                message_ttl_ms: 2_700_000,
                default_priority: 7,
                progress_throttle_ms: 100,
            },
        );
        policies.insert(
            JobKind::Sim,
            KindPolicy {
                max_retries: 3,
                base_backoff_ms: 200,
                cap_backoff_ms: 5_000,
                wall_clock_ms: 3_600_000,
                message_ttl_ms: 3_600_000,
                default_priority: 7,
                progress_throttle_ms: 100,
            },
        );
        policies.insert(
            JobKind::Report,
            KindPolicy {
                max_retries: 2,
                base_backoff_ms: 200,
                cap_backoff_ms: 5_000,
                wall_clock_ms: 900_000,
                message_ttl_ms: 900_000,
                default_priority: 3,
                progress_throttle_ms: 100,
            },
        );
        policies.insert(
            JobKind::Erp,
            KindPolicy {
                max_retries: 2,
                base_backoff_ms: 200,
                cap_backoff_ms: 5_000,
                wall_clock_ms: 1_800_000,
                message_ttl_ms: 1_800_000,
                default_priority: 5,
                progress_throttle_ms: 100,
            },
        );
        Self { policies }
    }

    pub fn policy(&self, kind: JobKind) -> &KindPolicy {
        self.policies
            .get(&kind)
            .expect("routing table covers every kind")
    }

    /// Apply one override, used by config loading.
    pub fn set_policy(&mut self, kind: JobKind, policy: KindPolicy) {
        self.policies.insert(kind, policy);
    }

    /// Parse and validate an externally supplied kind string.
    pub fn parse_kind(&self, raw: &str) -> Result<JobKind, EngineError> {
        JobKind::parse(raw).ok_or_else(|| {
            EngineError::validation(format!(
                "unknown job kind '{raw}', expected one of: ai, model, cam, sim, report, erp"
            ))
        })
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::standard()
    }
}
