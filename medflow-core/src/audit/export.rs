//! Rendering of audit entries for compliance export.

use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{AuditEntry, AuditError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Csv,
    Text,
}

impl FromStr for ExportFormat {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" => Ok(ExportFormat::Jsonl),
            "csv" => Ok(ExportFormat::Csv),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(AuditError::Serialization(format!(
                "unknown export format '{other}'"
            ))),
        }
    }
}

/// Stateless exporter for audit entries.
pub struct AuditExporter;

impl AuditExporter {
    pub fn export(entries: &[AuditEntry], format: ExportFormat) -> Result<String, AuditError> {
        match format {
            ExportFormat::Json => Self::to_json(entries),
            ExportFormat::Jsonl => Self::to_jsonl(entries),
            ExportFormat::Csv => Ok(Self::to_csv(entries)),
            ExportFormat::Text => Ok(Self::to_text(entries)),
        }
    }

    pub fn to_json(entries: &[AuditEntry]) -> Result<String, AuditError> {
        Ok(serde_json::to_string_pretty(entries)?)
    }

    /// One JSON object per line.
    pub fn to_jsonl(entries: &[AuditEntry]) -> Result<String, AuditError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        Ok(buf)
    }

    /// Columns: `sequence,timestamp,instance_id,step_id,kind,actor,payload_digest,metadata`
    pub fn to_csv(entries: &[AuditEntry]) -> String {
        let mut buf = String::from(
            "sequence,timestamp,instance_id,step_id,kind,actor,payload_digest,metadata\n",
        );
        for e in entries {
            let metadata = serde_json::to_string(&e.metadata).unwrap_or_default();
            let _ = writeln!(
                buf,
                "{},{},{},{},{},{},{},{}",
                e.sequence,
                e.timestamp.to_rfc3339(),
                e.instance_id,
                csv_escape(e.step_id.as_deref().unwrap_or("")),
                e.kind,
                csv_escape(e.actor.as_str()),
                e.payload_digest.as_deref().unwrap_or(""),
                csv_escape(&metadata),
            );
        }
        buf
    }

    /// Human-readable trail, one line per entry.
    pub fn to_text(entries: &[AuditEntry]) -> String {
        let mut buf = String::new();
        for e in entries {
            let _ = write!(
                buf,
                "[{}] {} {} by {}",
                e.sequence,
                e.timestamp.to_rfc3339(),
                e.kind,
                e.actor
            );
            if let Some(step) = &e.step_id {
                let _ = write!(buf, " step={step}");
            }
            if let Some(digest) = &e.payload_digest {
                let _ = write!(buf, " digest={}", &digest[..digest.len().min(12)]);
            }
            buf.push('\n');
        }
        buf
    }
}

/// Quote a CSV field if it contains a comma, newline, or double-quote,
/// doubling embedded double-quotes.
fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEventKind;
    use crate::types::Actor;
    use serde_json::json;
    use uuid::Uuid;

    fn entries() -> Vec<AuditEntry> {
        vec![
            AuditEntry::new(Uuid::nil(), AuditEventKind::InstanceCreated, Actor::new("nurse.kim"))
                .digest_of(&json!({"note": "n"})),
            AuditEntry::new(Uuid::nil(), AuditEventKind::StepFailed, Actor::system())
                .step("summarize")
                .meta("error", "timeout, retried"),
        ]
    }

    #[test]
    fn test_csv_has_header_and_escapes() {
        let csv = AuditExporter::to_csv(&entries());
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sequence,timestamp"));
        assert!(lines[2].contains("step_failed"));
        assert!(lines[2].contains("\"{\"\"error\"\":\"\"timeout, retried\"\"}\""));
    }

    #[test]
    fn test_jsonl_line_per_entry() {
        let out = AuditExporter::to_jsonl(&entries()).unwrap();
        assert_eq!(out.lines().count(), 2);
        let first: AuditEntry = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(first.kind, AuditEventKind::InstanceCreated);
    }

    #[test]
    fn test_text_mentions_step_and_actor() {
        let text = AuditExporter::to_text(&entries());
        assert!(text.contains("by nurse.kim"));
        assert!(text.contains("step=summarize"));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
