//! Shared primitive types: actors, identifiers, and payload digests.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Unique identifier of a workflow instance.
pub type InstanceId = Uuid;

/// The authenticated principal behind an operation (a clinician, a service
/// account, or the engine itself). Every audit entry names one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    pub const SYSTEM: &'static str = "system";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The engine acting on its own behalf (retries, late results).
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Actor {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// SHA-256 of arbitrary bytes as lowercase hex.
pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest of a JSON payload, used wherever the audit trail has to refer to
/// clinical data without storing it.
///
/// `serde_json::Map` keeps keys sorted, so the serialized form is canonical
/// and equal payloads always digest equally.
pub fn payload_digest(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex_sha256(&bytes)
}
