//! # Hash-chained audit integrity
//!
//! Every committed audit entry is linked into an append-only SHA-256 chain.
//! Each [`ChainLink`] hashes the entry's canonical bytes together with the
//! previous link, so rewriting or dropping any entry breaks verification of
//! every later link.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::hex_sha256;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One link of the chain, parallel to one audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Audit sequence number this link covers.
    pub sequence: u64,
    /// SHA-256 of the entry bytes.
    pub entry_hash: String,
    /// Chain hash of the previous link (zeros for the first link).
    pub previous_hash: String,
    /// SHA-256(sequence || entry_hash || previous_hash).
    pub chain_hash: String,
}

/// Outcome of [`AuditChain::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub checked_links: usize,
    /// Position of the first link that failed, if any.
    pub first_invalid: Option<usize>,
}

/// Append-only chain of links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditChain {
    links: Vec<ChainLink>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    /// Hash of the latest link, which commits to the whole history.
    pub fn head(&self) -> Option<&str> {
        self.links.last().map(|l| l.chain_hash.as_str())
    }

    pub fn append(&mut self, sequence: u64, entry_bytes: &[u8]) -> &ChainLink {
        let entry_hash = hex_sha256(entry_bytes);
        let previous_hash = self
            .links
            .last()
            .map(|l| l.chain_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let chain_hash = link_hash(sequence, &entry_hash, &previous_hash);
        self.links.push(ChainLink {
            sequence,
            entry_hash,
            previous_hash,
            chain_hash,
        });
        &self.links[self.links.len() - 1]
    }

    /// Check every link's own hash and its back-pointer.
    pub fn verify(&self) -> ChainVerification {
        for (index, link) in self.links.iter().enumerate() {
            let expected_previous = if index == 0 {
                GENESIS_HASH
            } else {
                self.links[index - 1].chain_hash.as_str()
            };
            let recomputed = link_hash(link.sequence, &link.entry_hash, &link.previous_hash);
            if link.previous_hash != expected_previous || recomputed != link.chain_hash {
                return ChainVerification {
                    is_valid: false,
                    checked_links: index + 1,
                    first_invalid: Some(index),
                };
            }
        }
        ChainVerification {
            is_valid: true,
            checked_links: self.links.len(),
            first_invalid: None,
        }
    }

    /// Check that `entries` (in order) are exactly the ones the chain covers.
    pub fn verify_against<'a>(
        &self,
        entries: impl IntoIterator<Item = (u64, &'a [u8])>,
    ) -> ChainVerification {
        let structural = self.verify();
        if !structural.is_valid {
            return structural;
        }
        let mut checked = 0;
        for (index, (sequence, bytes)) in entries.into_iter().enumerate() {
            checked = index + 1;
            let matches = self
                .links
                .get(index)
                .is_some_and(|l| l.sequence == sequence && l.entry_hash == hex_sha256(bytes));
            if !matches {
                return ChainVerification {
                    is_valid: false,
                    checked_links: checked,
                    first_invalid: Some(index),
                };
            }
        }
        if checked != self.links.len() {
            return ChainVerification {
                is_valid: false,
                checked_links: checked,
                first_invalid: Some(checked),
            };
        }
        ChainVerification {
            is_valid: true,
            checked_links: checked,
            first_invalid: None,
        }
    }
}

fn link_hash(sequence: u64, entry_hash: &str, previous_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_le_bytes());
    hasher.update(entry_hash.as_bytes());
    hasher.update(previous_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
