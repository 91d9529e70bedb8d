use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::merkle::{AuditChain, ChainVerification};

use super::{AuditEntry, AuditError, AuditLog, AuditQuery};

#[derive(Default)]
struct Inner {
    entries: Vec<AuditEntry>,
    chain: Option<AuditChain>,
}

/// Process-local audit log, optionally hash-chained.
#[derive(Default)]
pub struct InMemoryAuditLog {
    inner: Mutex<Inner>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash_chain() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                chain: Some(AuditChain::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every entry in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.clone()
    }

    /// Check the stored entries against the hash chain. `None` when the log
    /// was created without one.
    pub fn verify_integrity(&self) -> Option<ChainVerification> {
        let inner = self.lock();
        let chain = inner.chain.as_ref()?;
        let encoded: Vec<(u64, Vec<u8>)> = inner
            .entries
            .iter()
            .map(|e| (e.sequence, serde_json::to_vec(e).unwrap_or_default()))
            .collect();
        Some(chain.verify_against(encoded.iter().map(|(s, b)| (*s, b.as_slice()))))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, mut entry: AuditEntry) -> Result<AuditEntry, AuditError> {
        let mut inner = self.lock();
        entry.sequence = inner.entries.len() as u64;
        if let Some(chain) = inner.chain.as_mut() {
            let bytes = serde_json::to_vec(&entry)?;
            chain.append(entry.sequence, &bytes);
        }
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    async fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(query.apply(self.lock().entries.iter()))
    }
}
