//! Hash chains over the audit trail
//!
//! Every audited row `(table_name, record_id)` carries its own chain: an
//! entry hashes `prev_hash || canonical JSON content`, where `prev_hash` is
//! the hash of the previous entry for the same row. Rewriting or dropping a
//! stored entry breaks every later link of that row's history.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::error::{PresenceError, Result};
use crate::model::AuditId;

use super::entry::AuditLog;

/// `prev_hash` of the first entry of each row
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub fn link_hash(prev_hash: &str, content: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(prev_hash.as_bytes());
    h.update(content);
    hex::encode(h.finalize())
}

/// Incremental verifier fed entries in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct ChainVerifier {
    heads: HashMap<(String, i64), String>,
    last_id: Option<AuditId>,
    verified: usize,
}

impl ChainVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, entry: &AuditLog) -> Result<()> {
        if self.last_id.map_or(false, |last| entry.id <= last) {
            return Err(PresenceError::TamperDetected(entry.id));
        }
        if entry.prev_hash != self.head(&entry.table_name, entry.record_id) {
            return Err(PresenceError::TamperDetected(entry.id));
        }
        let computed = entry
            .compute_hash()
            .map_err(|e| PresenceError::Serialization(e.to_string()))?;
        if computed != entry.entry_hash {
            return Err(PresenceError::TamperDetected(entry.id));
        }
        self.heads
            .insert((entry.table_name.clone(), entry.record_id), computed);
        self.last_id = Some(entry.id);
        self.verified += 1;
        Ok(())
    }

    /// Number of entries verified so far
    pub fn verified(&self) -> usize {
        self.verified
    }

    /// Hash the next entry of a row must link to
    pub fn head(&self, table_name: &str, record_id: i64) -> &str {
        self.heads
            .get(&(table_name.to_string(), record_id))
            .map_or(GENESIS_HASH, String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{AuditAction, AuditDraft, PRESENCE_RECORDS};
    use chrono::Utc;

    /// `n` entries alternating between rows 1 and 2
    fn chain_of(n: u64) -> Vec<AuditLog> {
        let mut heads = [GENESIS_HASH.to_string(), GENESIS_HASH.to_string()];
        (1..=n)
            .map(|id| {
                let slot = (id % 2) as usize;
                let draft = AuditDraft::new(1, PRESENCE_RECORDS, slot as i64 + 1, AuditAction::Update);
                let log = AuditLog::seal(id, draft, Utc::now(), heads[slot].clone()).unwrap();
                heads[slot] = log.entry_hash.clone();
                log
            })
            .collect()
    }

    #[test]
    fn test_link_hash_is_hex_sha256() {
        let h = link_hash(GENESIS_HASH, b"content");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, link_hash(GENESIS_HASH, b"content"));
    }

    #[test]
    fn test_verifies_intact_chain() {
        let mut verifier = ChainVerifier::new();
        for entry in &chain_of(5) {
            verifier.check(entry).unwrap();
        }
        assert_eq!(verifier.verified(), 5);
    }

    #[test]
    fn test_detects_rewritten_entry() {
        let mut entries = chain_of(4);
        entries[2].changed_by = Some(99);

        let mut verifier = ChainVerifier::new();
        verifier.check(&entries[0]).unwrap();
        verifier.check(&entries[1]).unwrap();
        let err = verifier.check(&entries[2]).unwrap_err();
        assert!(matches!(err, PresenceError::TamperDetected(3)));
    }

    #[test]
    fn test_detects_removed_entry() {
        let mut entries = chain_of(5);
        // 1, 3 and 5 share a row; dropping 3 orphans 5
        entries.remove(2);

        let mut verifier = ChainVerifier::new();
        verifier.check(&entries[0]).unwrap();
        verifier.check(&entries[1]).unwrap();
        verifier.check(&entries[2]).unwrap();
        let err = verifier.check(&entries[3]).unwrap_err();
        assert!(matches!(err, PresenceError::TamperDetected(5)));
    }

    #[test]
    fn test_rows_chain_independently() {
        let entries = chain_of(4);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, GENESIS_HASH);
        assert_eq!(entries[2].prev_hash, entries[0].entry_hash);

        let mut verifier = ChainVerifier::new();
        for entry in &entries {
            verifier.check(entry).unwrap();
        }
        assert_eq!(verifier.head(PRESENCE_RECORDS, 2), entries[2].entry_hash);
        assert_eq!(verifier.head(PRESENCE_RECORDS, 7), GENESIS_HASH);
    }

    #[test]
    fn test_rejects_reordered_ids() {
        let entries = chain_of(2);
        let mut verifier = ChainVerifier::new();
        verifier.check(&entries[1]).unwrap();
        assert!(verifier.check(&entries[0]).is_err());
    }
}
