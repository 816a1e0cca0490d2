//! Query and append surface of the audit trail
//!
//! There is no way to rewrite or remove an entry through the store; `update`
//! and `delete` exist only to reject the attempt with a proper error.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{PresenceError, Result};
use crate::model::{AuditId, OrganizationId};
use crate::store::{PresenceStore, Transaction};

use super::chain::ChainVerifier;
use super::entry::{AuditDraft, AuditLog};

const PAGE_SIZE: usize = 64;

/// Which entries a cursor walks
#[derive(Clone, Debug, PartialEq)]
pub enum AuditFilter {
    /// History of one row, by weak back-reference
    Record { table_name: String, record_id: i64 },
    /// Everything an organization changed since a point in time
    Organization {
        organization: OrganizationId,
        since: DateTime<Utc>,
    },
}

pub struct AuditTrail {
    store: Arc<PresenceStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<PresenceStore>) -> Self {
        Self { store }
    }

    /// Append a standalone entry in its own transaction.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditId> {
        let mut tx = Transaction::new();
        tx.audit(draft);
        let receipt = self.store.commit(tx)?;
        receipt
            .audit_ids
            .first()
            .copied()
            .ok_or_else(|| PresenceError::StorageUnavailable("audit append not recorded".into()))
    }

    pub fn update(&self, id: AuditId, _new_values: Value) -> Result<()> {
        log::warn!("Rejected attempt to modify audit entry {}", id);
        Err(PresenceError::ImmutableRecord(format!(
            "audit entry {} cannot be modified",
            id
        )))
    }

    pub fn delete(&self, id: AuditId) -> Result<()> {
        log::warn!("Rejected attempt to delete audit entry {}", id);
        Err(PresenceError::ImmutableRecord(format!(
            "audit entry {} cannot be deleted",
            id
        )))
    }

    pub fn get(&self, id: AuditId) -> Option<AuditLog> {
        self.store.read(|t| t.audit_entry(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.store.read(|t| t.audit_len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// History of one row, newest first
    pub fn find_for(&self, table_name: &str, record_id: i64) -> AuditCursor {
        AuditCursor::new(
            self.store.clone(),
            AuditFilter::Record {
                table_name: table_name.to_string(),
                record_id,
            },
        )
    }

    /// Organization-wide changes at or after `since`, newest first
    pub fn find_for_organization(
        &self,
        organization: OrganizationId,
        since: DateTime<Utc>,
    ) -> AuditCursor {
        AuditCursor::new(
            self.store.clone(),
            AuditFilter::Organization {
                organization,
                since,
            },
        )
    }

    /// Walk the whole trail oldest-first, checking every row's chain; returns
    /// the number of verified entries.
    pub fn verify_chain(&self) -> Result<usize> {
        let mut verifier = ChainVerifier::new();
        let mut after: AuditId = 0;
        loop {
            let page = self.store.read(|t| t.audit_range(after, PAGE_SIZE));
            if page.is_empty() {
                break;
            }
            for entry in &page {
                verifier.check(entry)?;
                after = entry.id;
            }
        }
        Ok(verifier.verified())
    }
}

/// Lazy newest-first walk over matching entries. Pages are fetched on demand
/// so the store is never locked for the lifetime of the iteration.
pub struct AuditCursor {
    store: Arc<PresenceStore>,
    filter: AuditFilter,
    before: Option<AuditId>,
    buffer: VecDeque<AuditLog>,
    exhausted: bool,
}

impl AuditCursor {
    fn new(store: Arc<PresenceStore>, filter: AuditFilter) -> Self {
        Self {
            store,
            filter,
            before: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) {
        let page = self
            .store
            .read(|t| t.audit_page(&self.filter, self.before, PAGE_SIZE));
        if page.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.before = Some(last.id);
        }
        self.buffer.extend(page);
    }
}

impl Iterator for AuditCursor {
    type Item = AuditLog;

    fn next(&mut self) -> Option<AuditLog> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        self.buffer.pop_front()
    }
}
