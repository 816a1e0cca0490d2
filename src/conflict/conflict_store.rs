//! Storage-facing operations on sync conflicts
//!
//! Conflicts are staged into the caller's transaction so that a conflict and
//! the audit entry announcing it commit together.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{AuditAction, AuditDraft, SYNC_CONFLICTS};
use crate::error::{PresenceError, Result};
use crate::model::{ActorId, ConflictId, OrganizationId, Pairing};
use crate::store::{PresenceStore, Transaction};

use super::types::{ResolvedWith, SyncConflict, VersionPayload};

const PAGE_SIZE: usize = 32;

pub struct ConflictStore {
    store: Arc<PresenceStore>,
}

impl ConflictStore {
    pub fn new(store: Arc<PresenceStore>) -> Self {
        Self { store }
    }

    /// Stage a new open conflict. Never merges with earlier open conflicts of
    /// the same pairing; each divergence is tracked on its own.
    pub fn record_conflict(
        &self,
        tx: &mut Transaction,
        organization: OrganizationId,
        pairing: Pairing,
        version_a: VersionPayload,
        version_b: VersionPayload,
    ) -> SyncConflict {
        let conflict = SyncConflict {
            id: self.store.next_conflict_id(),
            organization,
            session: pairing.session,
            participant: pairing.participant,
            version_a,
            version_b,
            resolved_with: None,
            resolved_at: None,
            resolved_by: None,
            created_at: Utc::now(),
        };
        tx.put_conflict(conflict.clone());
        conflict
    }

    /// Stage the resolution marker of an open conflict, with its audit entry.
    pub fn mark_resolved(
        &self,
        tx: &mut Transaction,
        conflict: &SyncConflict,
        resolved_with: ResolvedWith,
        actor: Option<ActorId>,
        at: DateTime<Utc>,
    ) -> Result<SyncConflict> {
        if conflict.is_resolved() {
            return Err(PresenceError::AlreadyResolved(conflict.id));
        }
        let mut resolved = conflict.clone();
        resolved.resolved_with = Some(resolved_with);
        resolved.resolved_at = Some(at);
        resolved.resolved_by = actor;

        tx.audit(
            AuditDraft::new(
                conflict.organization,
                SYNC_CONFLICTS,
                conflict.id,
                AuditAction::Update,
            )
            .changed_by(actor)
            .old_values(conflict.snapshot())
            .new_values(resolved.snapshot())
            .conflict(conflict.id),
        );
        tx.put_conflict(resolved.clone());
        Ok(resolved)
    }

    pub fn get(&self, id: ConflictId) -> Option<SyncConflict> {
        self.store.read(|t| t.conflict(id).cloned())
    }

    /// Open conflicts of an organization, oldest (highest priority) first
    pub fn list_open(&self, organization: OrganizationId) -> ConflictCursor {
        ConflictCursor {
            store: self.store.clone(),
            organization,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn open_for(&self, pairing: Pairing) -> Vec<SyncConflict> {
        self.history_for(pairing)
            .into_iter()
            .filter(|c| !c.is_resolved())
            .collect()
    }

    /// Every conflict ever recorded for a pairing, resolved or not
    pub fn history_for(&self, pairing: Pairing) -> Vec<SyncConflict> {
        self.store.read(|t| t.conflicts_for(pairing))
    }
}

/// Lazy oldest-first walk over open conflicts.
pub struct ConflictCursor {
    store: Arc<PresenceStore>,
    organization: OrganizationId,
    after: Option<ConflictId>,
    buffer: VecDeque<SyncConflict>,
    exhausted: bool,
}

impl Iterator for ConflictCursor {
    type Item = SyncConflict;

    fn next(&mut self) -> Option<SyncConflict> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self.store.read(|t| {
                t.open_conflicts_after(self.organization, self.after, PAGE_SIZE)
            });
            self.exhausted = page.len() < PAGE_SIZE;
            if let Some(last) = page.last() {
                self.after = Some(last.id);
            }
            self.buffer.extend(page);
        }
        self.buffer.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Domain, PresenceState};
    use serde_json::json;
    use uuid::Uuid;

    fn setup() -> (Arc<PresenceStore>, ConflictStore, PresenceState) {
        let store = Arc::new(PresenceStore::in_memory());
        let state = PresenceState {
            id: store.next_state_id(),
            organization: 1,
            domain: Domain::Education,
            code: "present".into(),
            label: "Present".into(),
            color: "#22c55e".into(),
            sort_order: 0,
            is_default: true,
            created_at: Utc::now(),
        };
        let mut tx = Transaction::new();
        tx.put_state(state.clone());
        store.commit(tx).unwrap();
        (store.clone(), ConflictStore::new(store), state)
    }

    fn version(state: &PresenceState, device: &str) -> VersionPayload {
        VersionPayload {
            submission: Some(Uuid::new_v4()),
            state: state.id,
            state_code: state.code.clone(),
            device: Some(device.to_string()),
            actor: None,
            submitted_at: Utc::now(),
            extra_data: json!({}),
        }
    }

    #[test]
    fn test_each_divergence_is_tracked_separately() {
        let (store, conflicts, state) = setup();
        let pairing = Pairing::new(10, 20);
        for _ in 0..3 {
            let mut tx = Transaction::new();
            conflicts.record_conflict(&mut tx, 1, pairing, version(&state, "a"), version(&state, "b"));
            store.commit(tx).unwrap();
        }
        assert_eq!(conflicts.open_for(pairing).len(), 3);
        assert_eq!(conflicts.list_open(1).count(), 3);
        assert_eq!(conflicts.list_open(2).count(), 0);
    }

    #[test]
    fn test_list_open_is_oldest_first_and_skips_resolved() {
        let (store, conflicts, state) = setup();
        let mut ids = Vec::new();
        for participant in 0..40 {
            let mut tx = Transaction::new();
            let c = conflicts.record_conflict(
                &mut tx,
                1,
                Pairing::new(10, participant),
                version(&state, "a"),
                version(&state, "b"),
            );
            store.commit(tx).unwrap();
            ids.push(c.id);
        }

        let first = conflicts.get(ids[0]).unwrap();
        let mut tx = Transaction::new();
        conflicts
            .mark_resolved(&mut tx, &first, ResolvedWith::VersionA, Some(5), Utc::now())
            .unwrap();
        store.commit(tx).unwrap();

        let open: Vec<ConflictId> = conflicts.list_open(1).map(|c| c.id).collect();
        assert_eq!(open, ids[1..].to_vec());
    }

    #[test]
    fn test_resolution_is_terminal() {
        let (store, conflicts, state) = setup();
        let mut tx = Transaction::new();
        let open = conflicts.record_conflict(
            &mut tx,
            1,
            Pairing::new(10, 20),
            version(&state, "a"),
            version(&state, "b"),
        );
        store.commit(tx).unwrap();

        let mut tx = Transaction::new();
        let resolved = conflicts
            .mark_resolved(&mut tx, &open, ResolvedWith::VersionB, Some(5), Utc::now())
            .unwrap();
        store.commit(tx).unwrap();
        assert!(conflicts.get(open.id).unwrap().is_resolved());

        let mut tx = Transaction::new();
        assert!(matches!(
            conflicts.mark_resolved(&mut tx, &resolved, ResolvedWith::VersionA, None, Utc::now()),
            Err(PresenceError::AlreadyResolved(_))
        ));

        // A stale open copy cannot sneak a second resolution past the store
        let mut tx = Transaction::new();
        conflicts
            .mark_resolved(&mut tx, &open, ResolvedWith::VersionA, None, Utc::now())
            .unwrap();
        assert!(matches!(store.commit(tx), Err(PresenceError::AlreadyResolved(_))));
        assert_eq!(
            conflicts.get(open.id).unwrap().resolved_with,
            Some(ResolvedWith::VersionB)
        );
    }
}
