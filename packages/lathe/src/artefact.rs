//! Artefact references and the object-storage collaborator contract.
//!
//! The engine never handles artefact bytes. Jobs record `{bucket, key,
//! sha256, size}` references plus a retention tag; byte transfer happens
//! through presigned URLs generated by the collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;

/// Reference to an artefact held in external object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtefactRef {
    pub bucket: String,
    pub object_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    pub sha256: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,
}

impl ArtefactRef {
    pub fn describe(&self) -> String {
        format!("s3://{}/{} ({} bytes)", self.bucket, self.object_key, self.size)
    }
}

/// Narrow object-storage contract consumed by the core.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Presigned download URL for a stored object.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, EngineError>;

    /// Presigned upload URL for a new object.
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, EngineError>;

    /// Verify a stored object against an expected SHA-256 (hex).
    async fn verify_sha256(
        &self,
        bucket: &str,
        key: &str,
        expected_hex: &str,
    ) -> Result<bool, EngineError>;
}
