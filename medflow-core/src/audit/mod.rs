//! Audit log: append-only, attributable record of everything the engine does.
//!
//! Entries never contain clinical payloads. Data is referenced by a SHA-256
//! digest of its canonical JSON, and metadata carries only identifiers,
//! counters, and redacted messages. Writers must treat a failed append as
//! fatal and commit nothing.

pub mod export;
pub mod jsonl;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{AuditBackend, AuditConfig};
use crate::types::{Actor, payload_digest};

pub use export::{AuditExporter, ExportFormat};
pub use jsonl::{JsonlAuditLog, verify_jsonl};
pub use memory::InMemoryAuditLog;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuditError {
    #[error("Audit log unavailable: {0}")]
    Unavailable(String),

    #[error("Audit IO failed: {0}")]
    Io(String),

    #[error("Audit serialization failed: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Serialization(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    InstanceCreated,
    InstanceStarted,
    InstanceWaiting,
    InstanceResumed,
    InstanceCompleted,
    InstanceFailed,
    InstanceCancelled,
    StepDispatched,
    StepAwaitingInput,
    StepReleased,
    StepAttemptFailed,
    StepSucceeded,
    StepFailed,
    StepSkipped,
    AgentInvocationSucceeded,
    AgentInvocationFailed,
    HumanInputReceived,
    /// A step finished after its instance reached a terminal state. The
    /// result is recorded here and nowhere else.
    LateResultRecorded,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::InstanceCreated => "instance_created",
            AuditEventKind::InstanceStarted => "instance_started",
            AuditEventKind::InstanceWaiting => "instance_waiting",
            AuditEventKind::InstanceResumed => "instance_resumed",
            AuditEventKind::InstanceCompleted => "instance_completed",
            AuditEventKind::InstanceFailed => "instance_failed",
            AuditEventKind::InstanceCancelled => "instance_cancelled",
            AuditEventKind::StepDispatched => "step_dispatched",
            AuditEventKind::StepAwaitingInput => "step_awaiting_input",
            AuditEventKind::StepReleased => "step_released",
            AuditEventKind::StepAttemptFailed => "step_attempt_failed",
            AuditEventKind::StepSucceeded => "step_succeeded",
            AuditEventKind::StepFailed => "step_failed",
            AuditEventKind::StepSkipped => "step_skipped",
            AuditEventKind::AgentInvocationSucceeded => "agent_invocation_succeeded",
            AuditEventKind::AgentInvocationFailed => "agent_invocation_failed",
            AuditEventKind::HumanInputReceived => "human_input_received",
            AuditEventKind::LateResultRecorded => "late_result_recorded",
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the log on append; strictly increasing per log.
    pub sequence: u64,
    pub instance_id: Uuid,
    #[serde(default)]
    pub step_id: Option<String>,
    pub kind: AuditEventKind,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the canonical JSON of the payload this entry refers to.
    #[serde(default)]
    pub payload_digest: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AuditEntry {
    pub fn new(instance_id: Uuid, kind: AuditEventKind, actor: Actor) -> Self {
        Self {
            sequence: 0,
            instance_id,
            step_id: None,
            kind,
            actor,
            timestamp: Utc::now(),
            payload_digest: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn digest_of(mut self, payload: &Value) -> Self {
        self.payload_digest = Some(payload_digest(payload));
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Order entries by timestamp, breaking ties by append order.
pub fn sort_entries(entries: &mut [AuditEntry]) {
    entries.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.sequence.cmp(&b.sequence))
    });
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Builder-style filter over audit entries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub instance_id: Option<Uuid>,
    pub step_id: Option<String>,
    pub kind: Option<AuditEventKind>,
    pub actor: Option<Actor>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_instance(mut self, id: Uuid) -> Self {
        self.instance_id = Some(id);
        self
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn of_kind(mut self, kind: AuditEventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn by_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn since(mut self, dt: DateTime<Utc>) -> Self {
        self.since = Some(dt);
        self
    }

    pub fn until(mut self, dt: DateTime<Utc>) -> Self {
        self.until = Some(dt);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.instance_id.is_none_or(|id| entry.instance_id == id)
            && self
                .step_id
                .as_deref()
                .is_none_or(|s| entry.step_id.as_deref() == Some(s))
            && self.kind.is_none_or(|k| entry.kind == k)
            && self.actor.as_ref().is_none_or(|a| &entry.actor == a)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }

    /// Filter and order `entries`.
    pub fn apply<'a>(&self, entries: impl IntoIterator<Item = &'a AuditEntry>) -> Vec<AuditEntry> {
        let mut matched: Vec<AuditEntry> = entries
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        sort_entries(&mut matched);
        matched
    }
}

// ---------------------------------------------------------------------------
// Log trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Durably append an entry, assigning its sequence number. Returns the
    /// committed entry.
    async fn append(&self, entry: AuditEntry) -> Result<AuditEntry, AuditError>;

    /// Entries matching `query`, ordered by timestamp then append order.
    async fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError>;

    /// All entries of one instance, ordered by timestamp then append order.
    async fn query(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, AuditError> {
        self.search(&AuditQuery::new().for_instance(instance_id))
            .await
    }
}

/// Open the audit log described by configuration.
pub async fn open_audit_log(config: &AuditConfig) -> Result<Arc<dyn AuditLog>, AuditError> {
    match config.backend {
        AuditBackend::Memory => {
            let log = if config.hash_chain {
                InMemoryAuditLog::with_hash_chain()
            } else {
                InMemoryAuditLog::new()
            };
            Ok(Arc::new(log))
        }
        AuditBackend::Jsonl => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| AuditError::Unavailable("audit.path is not set".into()))?;
            Ok(Arc::new(JsonlAuditLog::open(path).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(seq: u64, offset_ms: i64, kind: AuditEventKind) -> AuditEntry {
        let base = DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut e = AuditEntry::new(Uuid::nil(), kind, Actor::system())
            .at(base + Duration::milliseconds(offset_ms));
        e.sequence = seq;
        e
    }

    #[test]
    fn test_builder_sets_digest_and_metadata() {
        let e = AuditEntry::new(Uuid::nil(), AuditEventKind::StepSucceeded, Actor::new("dr.a"))
            .step("summarize")
            .digest_of(&json!({"summary": "x"}))
            .meta("attempts", 2);
        assert_eq!(e.step_id.as_deref(), Some("summarize"));
        assert_eq!(e.payload_digest.as_ref().map(String::len), Some(64));
        assert_eq!(e.metadata["attempts"], json!(2));
    }

    #[test]
    fn test_sort_by_timestamp_then_sequence() {
        let mut entries = vec![
            entry(2, 10, AuditEventKind::StepSucceeded),
            entry(1, 10, AuditEventKind::StepDispatched),
            entry(0, 20, AuditEventKind::InstanceCreated),
        ];
        sort_entries(&mut entries);
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 0]);
    }

    #[test]
    fn test_query_filters() {
        let entries = vec![
            entry(0, 0, AuditEventKind::InstanceCreated),
            entry(1, 5, AuditEventKind::StepDispatched).step("a"),
            entry(2, 9, AuditEventKind::StepSucceeded).step("a"),
        ];
        let by_kind = AuditQuery::new()
            .of_kind(AuditEventKind::StepSucceeded)
            .apply(&entries);
        assert_eq!(by_kind.len(), 1);

        let by_step = AuditQuery::new().for_step("a").apply(&entries);
        assert_eq!(by_step.len(), 2);

        let other_instance = AuditQuery::new().for_instance(Uuid::new_v4()).apply(&entries);
        assert!(other_instance.is_empty());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditEventKind::AgentInvocationFailed).unwrap(),
            "\"agent_invocation_failed\""
        );
        assert_eq!(
            AuditEventKind::LateResultRecorded.to_string(),
            "late_result_recorded"
        );
    }
}
