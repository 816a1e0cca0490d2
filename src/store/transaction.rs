//! Staged write sets
//!
//! A `Transaction` collects every row change of one logical operation. The
//! store validates and applies it as a unit: either every change (including
//! its audit entries) becomes visible, or none does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditDraft, AuditLog};
use crate::conflict::SyncConflict;
use crate::model::{AuditId, PresenceRecord, PresenceState, StateId};

#[derive(Debug, Default, Clone)]
pub struct Transaction {
    pub(crate) states: Vec<PresenceState>,
    pub(crate) deleted_states: Vec<StateId>,
    pub(crate) records: Vec<PresenceRecord>,
    pub(crate) conflicts: Vec<SyncConflict>,
    pub(crate) audit: Vec<AuditDraft>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a presence state row
    pub fn put_state(&mut self, state: PresenceState) {
        self.states.push(state);
    }

    pub fn delete_state(&mut self, state: StateId) {
        self.deleted_states.push(state);
    }

    /// Insert or replace a presence record (keyed by id)
    pub fn put_record(&mut self, record: PresenceRecord) {
        self.records.push(record);
    }

    /// Insert a conflict, or store the resolution of an open one
    pub fn put_conflict(&mut self, conflict: SyncConflict) {
        self.conflicts.push(conflict);
    }

    pub fn audit(&mut self, draft: AuditDraft) {
        self.audit.push(draft);
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
            && self.deleted_states.is_empty()
            && self.records.is_empty()
            && self.conflicts.is_empty()
            && self.audit.is_empty()
    }
}

/// A committed transaction as written to the journal.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitEntry {
    pub seq: u64,
    pub committed_at: Option<DateTime<Utc>>,
    pub states: Vec<PresenceState>,
    pub deleted_states: Vec<StateId>,
    pub records: Vec<PresenceRecord>,
    pub conflicts: Vec<SyncConflict>,
    pub audit: Vec<AuditLog>,
}

/// What a successful commit produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub seq: u64,
    pub audit_ids: Vec<AuditId>,
}
