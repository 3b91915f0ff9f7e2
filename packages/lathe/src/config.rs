//! Engine configuration loaded from environment variables.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

use crate::envelope::MAX_PARAMS_BYTES;
use crate::error::EngineError;
use crate::topology::TopologyConfig;

/// Recognized engine options. Per-kind retry/timeout policy lives in the
/// routing table; this covers the process-wide knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Publish confirm retries before a job fails with `PUBLISH_FAILED`.
    pub publish_max_attempts: u32,
    pub publish_base_backoff_ms: u64,
    pub publish_cap_backoff_ms: u64,

    /// Canonical params size accepted at intake.
    pub max_params_bytes: usize,

    pub per_owner_rps: u32,
    pub global_rps: u32,

    pub job_retention_days: i64,
    pub idempotency_retention_days: i64,

    /// TTL of the distributed cancel-flag cache entries.
    pub cancel_cache_ttl_ms: u64,

    /// Sequence-race retries when appending audit events.
    pub audit_append_max_attempts: u32,

    pub topology: TopologyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            publish_max_attempts: 4,
            publish_base_backoff_ms: 200,
            publish_cap_backoff_ms: 5_000,
            max_params_bytes: MAX_PARAMS_BYTES,
            per_owner_rps: 10,
            global_rps: 200,
            job_retention_days: 30,
            idempotency_retention_days: 45,
            cancel_cache_ttl_ms: 30_000,
            audit_append_max_attempts: 8,
            topology: TopologyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        let config = Self {
            publish_max_attempts: env_or("LATHE_PUBLISH_MAX_ATTEMPTS", defaults.publish_max_attempts)?,
            publish_base_backoff_ms: env_or(
                "LATHE_PUBLISH_BASE_BACKOFF_MS",
                defaults.publish_base_backoff_ms,
            )?,
            publish_cap_backoff_ms: env_or(
                "LATHE_PUBLISH_CAP_BACKOFF_MS",
                defaults.publish_cap_backoff_ms,
            )?,
            max_params_bytes: env_or("LATHE_MAX_PARAMS_BYTES", defaults.max_params_bytes)?,
            per_owner_rps: env_or("LATHE_PER_OWNER_RPS", defaults.per_owner_rps)?,
            global_rps: env_or("LATHE_GLOBAL_RPS", defaults.global_rps)?,
            job_retention_days: env_or("LATHE_JOB_RETENTION_DAYS", defaults.job_retention_days)?,
            idempotency_retention_days: env_or(
                "LATHE_IDEMPOTENCY_RETENTION_DAYS",
                defaults.idempotency_retention_days,
            )?,
            cancel_cache_ttl_ms: env_or("LATHE_CANCEL_CACHE_TTL_MS", defaults.cancel_cache_ttl_ms)?,
            audit_append_max_attempts: env_or(
                "LATHE_AUDIT_APPEND_MAX_ATTEMPTS",
                defaults.audit_append_max_attempts,
            )?,
            topology: TopologyConfig {
                max_message_bytes: env_or(
                    "LATHE_MAX_MESSAGE_BYTES",
                    defaults.topology.max_message_bytes,
                )?,
                max_priority: defaults.topology.max_priority,
                dlq_ttl_ms: env_or("LATHE_DLQ_TTL_MS", defaults.topology.dlq_ttl_ms)?,
                dlq_max_len: env_or("LATHE_DLQ_MAX_LEN", defaults.topology.dlq_max_len)?,
            },
        };
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Cross-field validation, also run by `Engine::new`.
    pub fn validate(&self) -> Result<(), String> {
        if self.idempotency_retention_days < self.job_retention_days {
            return Err(format!(
                "idempotency retention ({} days) must cover job retention ({} days)",
                self.idempotency_retention_days, self.job_retention_days
            ));
        }
        if self.publish_max_attempts == 0 {
            return Err("publish_max_attempts must be >= 1".to_string());
        }
        if self.max_params_bytes == 0 || self.max_params_bytes > MAX_PARAMS_BYTES {
            return Err(format!(
                "max_params_bytes must be within 1..={MAX_PARAMS_BYTES}"
            ));
        }
        Ok(())
    }

    pub(crate) fn validated(self) -> Result<Self, EngineError> {
        self.validate()
            .map_err(|message| EngineError::Validation { message })?;
        Ok(self)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}
