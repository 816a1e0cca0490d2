//! Audit entry types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ActorId, AuditId, ConflictId, DeviceId, OrganizationId};

use super::chain;

pub const PRESENCE_STATES: &str = "presence_states";
pub const PRESENCE_RECORDS: &str = "presence_records";
pub const SYNC_CONFLICTS: &str = "sync_conflicts";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

/// An audit entry that has not been written yet. The store assigns its id,
/// timestamp and chain hashes at commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditDraft {
    pub organization: OrganizationId,
    pub table_name: String,
    pub record_id: i64,
    pub action: AuditAction,
    pub changed_by: Option<ActorId>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub source_device: Option<DeviceId>,
    /// Set when the change was produced by detecting or resolving a sync conflict
    pub conflict: Option<ConflictId>,
}

impl AuditDraft {
    pub fn new(
        organization: OrganizationId,
        table_name: impl Into<String>,
        record_id: i64,
        action: AuditAction,
    ) -> Self {
        Self {
            organization,
            table_name: table_name.into(),
            record_id,
            action,
            changed_by: None,
            old_values: None,
            new_values: None,
            source_device: None,
            conflict: None,
        }
    }

    pub fn changed_by(mut self, actor: Option<ActorId>) -> Self {
        self.changed_by = actor;
        self
    }

    pub fn old_values(mut self, values: Value) -> Self {
        self.old_values = Some(values);
        self
    }

    pub fn new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    pub fn source_device(mut self, device: Option<DeviceId>) -> Self {
        self.source_device = device;
        self
    }

    pub fn conflict(mut self, conflict: ConflictId) -> Self {
        self.conflict = Some(conflict);
        self
    }
}

/// One immutable, hash-linked change record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: AuditId,
    pub organization: OrganizationId,
    pub table_name: String,
    pub record_id: i64,
    pub action: AuditAction,
    pub changed_by: Option<ActorId>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub changed_at: DateTime<Utc>,
    pub source_device: Option<DeviceId>,
    pub conflict: Option<ConflictId>,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// The fields covered by the entry hash
#[derive(Serialize)]
pub(crate) struct HashedContent<'a> {
    id: AuditId,
    organization: OrganizationId,
    table_name: &'a str,
    record_id: i64,
    action: AuditAction,
    changed_by: Option<ActorId>,
    old_values: &'a Option<Value>,
    new_values: &'a Option<Value>,
    changed_at: &'a DateTime<Utc>,
    source_device: &'a Option<DeviceId>,
    conflict: Option<ConflictId>,
}

impl AuditLog {
    /// Turn a draft into a sealed entry linked to `prev_hash`.
    pub(crate) fn seal(
        id: AuditId,
        draft: AuditDraft,
        changed_at: DateTime<Utc>,
        prev_hash: String,
    ) -> Result<Self, serde_json::Error> {
        let mut log = Self {
            id,
            organization: draft.organization,
            table_name: draft.table_name,
            record_id: draft.record_id,
            action: draft.action,
            changed_by: draft.changed_by,
            old_values: draft.old_values,
            new_values: draft.new_values,
            changed_at,
            source_device: draft.source_device,
            conflict: draft.conflict,
            prev_hash,
            entry_hash: String::new(),
        };
        log.entry_hash = log.compute_hash()?;
        Ok(log)
    }

    pub(crate) fn hashed_content(&self) -> HashedContent<'_> {
        HashedContent {
            id: self.id,
            organization: self.organization,
            table_name: &self.table_name,
            record_id: self.record_id,
            action: self.action,
            changed_by: self.changed_by,
            old_values: &self.old_values,
            new_values: &self.new_values,
            changed_at: &self.changed_at,
            source_device: &self.source_device,
            conflict: self.conflict,
        }
    }

    /// Recompute this entry's hash from its content and `prev_hash`.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let content = serde_json::to_vec(&self.hashed_content())?;
        Ok(chain::link_hash(&self.prev_hash, &content))
    }

    /// State code recorded before the change, if the snapshot has one
    pub fn old_state(&self) -> Option<&str> {
        self.old_values
            .as_ref()
            .and_then(|v| v.get("presence_state"))
            .and_then(Value::as_str)
    }

    /// State code recorded after the change, if the snapshot has one
    pub fn new_state(&self) -> Option<&str> {
        self.new_values
            .as_ref()
            .and_then(|v| v.get("presence_state"))
            .and_then(Value::as_str)
    }
}
