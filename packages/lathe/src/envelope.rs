//! Task envelope: the stable wire format between publisher and workers.
//!
//! Version 1, JSON, UTF-8, canonicalized at publish time. Params travel
//! inline up to the intake bound; anything larger is passed by object-storage
//! reference.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_string;
use crate::error::EngineError;
use crate::job::{Job, JobId, JobKind, OwnerId};

pub const ENVELOPE_VERSION: u32 = 1;

/// Hard serialized-size bound, aligned with the queue `x-max-length-bytes`.
pub const MAX_ENVELOPE_BYTES: usize = 10 * 1024 * 1024;

/// Intake bound on canonical params size.
pub const MAX_PARAMS_BYTES: usize = 256 * 1024;

/// Inline params object, or a reference into object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskParams {
    Ref {
        #[serde(rename = "ref")]
        ref_key: String,
    },
    Inline(serde_json::Map<String, serde_json::Value>),
}

impl TaskParams {
    pub fn inline(params: &serde_json::Value) -> Result<Self, EngineError> {
        match params.as_object() {
            Some(map) => Ok(TaskParams::Inline(map.clone())),
            None => Err(EngineError::validation("params must be a JSON object")),
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, TaskParams::Ref { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub v: u32,
    pub job_id: JobId,
    pub kind: JobKind,
    pub params: TaskParams,
    pub submitted_by: OwnerId,
    pub attempt: i32,
    pub trace_id: String,
    pub idempotency_key: String,
}

impl TaskEnvelope {
    /// Build the envelope for a dispatch of `job`. `attempt` is the 1-based
    /// dispatch number carried on the wire.
    pub fn for_job(job: &Job, attempt: i32) -> Result<Self, EngineError> {
        Ok(Self {
            v: ENVELOPE_VERSION,
            job_id: job.id,
            kind: job.kind,
            params: TaskParams::inline(&job.params)?,
            submitted_by: job.owner,
            attempt,
            trace_id: job.trace_id.clone(),
            idempotency_key: job.idempotency_key.clone(),
        })
    }

    /// Canonical serialized form, bounded by [`MAX_ENVELOPE_BYTES`].
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let value = serde_json::to_value(self).map_err(|e| EngineError::Fatal {
            message: format!("envelope serialization failed: {e}"),
        })?;
        let bytes = canonical_string(&value).into_bytes();
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(EngineError::PayloadTooLarge {
                size: bytes.len(),
                limit: MAX_ENVELOPE_BYTES,
            });
        }
        Ok(bytes)
    }

    /// Parse and validate a received envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(EngineError::PayloadTooLarge {
                size: bytes.len(),
                limit: MAX_ENVELOPE_BYTES,
            });
        }
        let envelope: TaskEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::validation(format!("malformed task envelope: {e}")))?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(EngineError::validation(format!(
                "unsupported envelope version {}",
                envelope.v
            )));
        }
        if envelope.attempt < 1 {
            return Err(EngineError::validation("envelope attempt must be >= 1"));
        }
        Ok(envelope)
    }

    pub fn describe(&self) -> String {
        format!(
            "task job_id={} kind={} attempt={} trace={}",
            self.job_id, self.kind, self.attempt, self.trace_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job::builder()
            .id(7_i64)
            .owner(42_i64)
            .kind(JobKind::Model)
            .params(json!({"l": 10, "w": 5}))
            .idempotency_key("abc")
            .trace_id("0123456789abcdef0123456789abcdef")
            .created_at(now)
            .updated_at(now)
            .build()
    }

    #[test]
    fn envelope_round_trips_through_canonical_bytes() {
        let envelope = TaskEnvelope::for_job(&sample_job(), 1).unwrap();
        let bytes = envelope.to_canonical_bytes().unwrap();
        let parsed = TaskEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn canonical_bytes_have_sorted_keys() {
        let envelope = TaskEnvelope::for_job(&sample_job(), 1).unwrap();
        let text = String::from_utf8(envelope.to_canonical_bytes().unwrap()).unwrap();
        let attempt_pos = text.find("\"attempt\"").unwrap();
        let job_id_pos = text.find("\"job_id\"").unwrap();
        let v_pos = text.find("\"v\"").unwrap();
        assert!(attempt_pos < job_id_pos);
        assert!(job_id_pos < v_pos);
    }

    #[test]
    fn ref_params_parse_from_wire_form() {
        let wire = br#"{"v":1,"job_id":9,"kind":"cam","params":{"ref":"params/9.json"},"submitted_by":42,"attempt":2,"trace_id":"ab","idempotency_key":"k"}"#;
        let envelope = TaskEnvelope::from_bytes(wire).unwrap();
        match &envelope.params {
            TaskParams::Ref { ref_key } => assert_eq!(ref_key, "params/9.json"),
            other => panic!("expected ref params, got {other:?}"),
        }
    }

    #[test]
    fn inline_params_must_be_an_object() {
        assert!(TaskParams::inline(&json!([1, 2, 3])).is_err());
        assert!(TaskParams::inline(&json!("scalar")).is_err());
        assert!(TaskParams::inline(&json!({"ok": true})).is_ok());
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let wire = br#"{"v":2,"job_id":9,"kind":"cam","params":{},"submitted_by":42,"attempt":1,"trace_id":"ab","idempotency_key":"k"}"#;
        assert!(TaskEnvelope::from_bytes(wire).is_err());
    }

    #[test]
    fn zero_attempt_is_rejected() {
        let wire = br#"{"v":1,"job_id":9,"kind":"cam","params":{},"submitted_by":42,"attempt":0,"trace_id":"ab","idempotency_key":"k"}"#;
        assert!(TaskEnvelope::from_bytes(wire).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected_before_parse() {
        let huge = vec![b'x'; MAX_ENVELOPE_BYTES + 1];
        match TaskEnvelope::from_bytes(&huge) {
            Err(EngineError::PayloadTooLarge { .. }) => {}
            other => panic!("expected PayloadTooLarge, got {other:?}"),
        }
    }
}
