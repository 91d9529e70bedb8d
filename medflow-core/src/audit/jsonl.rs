//! Append-only JSON Lines audit log.
//!
//! Each line holds one entry and the chain hash covering it and every entry
//! before it. Appends are fsynced before they are acknowledged.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::merkle::{AuditChain, ChainVerification};

use super::{AuditEntry, AuditError, AuditLog, AuditQuery};

#[derive(Debug, Serialize, Deserialize)]
struct JsonlRecord {
    entry: AuditEntry,
    chain_hash: String,
}

struct Writer {
    file: File,
    chain: AuditChain,
    next_sequence: u64,
}

pub struct JsonlAuditLog {
    path: PathBuf,
    writer: Mutex<Writer>,
}

impl JsonlAuditLog {
    /// Open (or create) a log file, replaying existing lines to restore the
    /// sequence counter and the chain head.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut chain = AuditChain::new();
        let mut next_sequence = 0;
        for record in read_records(&path).await? {
            let bytes = serde_json::to_vec(&record.entry)?;
            let link = chain.append(record.entry.sequence, &bytes);
            if link.chain_hash != record.chain_hash {
                return Err(AuditError::Unavailable(format!(
                    "{} fails integrity check at sequence {}",
                    path.display(),
                    record.entry.sequence
                )));
            }
            next_sequence = record.entry.sequence + 1;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), next_sequence, "Opened JSONL audit log");
        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                chain,
                next_sequence,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry in the file, in append order.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let _guard = self.writer.lock().await;
        Ok(read_records(&self.path)
            .await?
            .into_iter()
            .map(|r| r.entry)
            .collect())
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, AuditError> {
        let mut writer = self.writer.lock().await;
        entry.sequence = writer.next_sequence;

        let bytes = serde_json::to_vec(&entry)?;
        let mut chain = writer.chain.clone();
        let chain_hash = chain.append(entry.sequence, &bytes).chain_hash.clone();
        let mut line = serde_json::to_vec(&JsonlRecord {
            entry: entry.clone(),
            chain_hash,
        })?;
        line.push(b'\n');

        let written = async {
            writer.file.write_all(&line).await?;
            writer.file.flush().await?;
            writer.file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            error!(path = %self.path.display(), error = %e, "Audit append failed");
            return Err(e.into());
        }

        writer.chain = chain;
        writer.next_sequence += 1;
        Ok(entry)
    }

    async fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        let entries = self.read_all().await?;
        Ok(query.apply(entries.iter()))
    }
}

async fn read_records(path: &Path) -> Result<Vec<JsonlRecord>, AuditError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str::<JsonlRecord>(l).map_err(AuditError::from))
        .collect()
}

/// Recompute the hash chain of a JSONL log file and compare it with the
/// hashes stored on each line.
pub async fn verify_jsonl(path: &Path) -> Result<ChainVerification, AuditError> {
    let records = read_records(path).await?;
    let mut chain = AuditChain::new();
    for (index, record) in records.iter().enumerate() {
        let bytes = serde_json::to_vec(&record.entry)?;
        let expected_sequence = index as u64;
        let link = chain.append(record.entry.sequence, &bytes);
        if record.entry.sequence != expected_sequence || link.chain_hash != record.chain_hash {
            return Ok(ChainVerification {
                is_valid: false,
                checked_links: index + 1,
                first_invalid: Some(index),
            });
        }
    }
    Ok(ChainVerification {
        is_valid: true,
        checked_links: records.len(),
        first_invalid: None,
    })
}
