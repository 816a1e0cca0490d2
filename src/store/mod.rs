//! Transactional storage for presence states, records, conflicts and the
//! audit trail.
//!
//! Tables live in memory behind one mutex; durability comes from the
//! [`Journal`]. A commit runs in three steps:
//!
//! 1. under the table lock: validate, reserve the rows it touches, assign
//!    audit ids and seal the audit entries onto their chains;
//! 2. without any store lock: write the commit to the journal;
//! 3. under the table lock again: apply it (or drop the reservation when the
//!    journal refused it).
//!
//! Commits touching different rows therefore never wait on each other's
//! journal write. A row with a commit in flight cannot be touched by another
//! commit until the first one is settled.

mod journal;
mod transaction;

pub use journal::{FileJournal, Journal, MemoryJournal};
pub use transaction::{CommitEntry, CommitReceipt, Transaction};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::audit::{chain, AuditFilter, AuditLog, PRESENCE_RECORDS, PRESENCE_STATES, SYNC_CONFLICTS};
use crate::conflict::SyncConflict;
use crate::error::{PresenceError, Result};
use crate::model::{
    AuditId, ConflictId, Domain, OrganizationId, Pairing, PresenceRecord, PresenceState,
    RecordId, SessionId, StateId,
};

type StateKey = (OrganizationId, Domain, String);

/// A row as the audit trail names it: `(table_name, record_id)`
type RowKey = (String, i64);

/// Rows and unique keys claimed by commits whose journal write is in flight
#[derive(Default)]
struct Pending {
    rows: HashSet<RowKey>,
    pairings: HashSet<Pairing>,
    state_keys: HashSet<StateKey>,
    deleted_states: HashSet<StateId>,
    state_refs: HashMap<StateId, usize>,
}

/// What a prepared commit holds in [`Pending`]
#[derive(Default)]
struct Reservation {
    rows: Vec<RowKey>,
    pairings: Vec<Pairing>,
    state_keys: Vec<StateKey>,
    deleted_states: Vec<StateId>,
    state_refs: Vec<StateId>,
    seq: u64,
    audit_ids: std::ops::Range<AuditId>,
}

/// A sealed commit waiting for its journal write
struct Prepared {
    entry: CommitEntry,
    reservation: Reservation,
}

/// In-memory tables. Read access is handed out through [`PresenceStore::read`].
pub struct Tables {
    states: BTreeMap<StateId, PresenceState>,
    state_keys: HashMap<StateKey, StateId>,
    records: BTreeMap<RecordId, PresenceRecord>,
    pairings: HashMap<Pairing, RecordId>,
    conflicts: BTreeMap<ConflictId, SyncConflict>,
    audit: BTreeMap<AuditId, AuditLog>,
    audit_by_record: HashMap<RowKey, Vec<AuditId>>,
    /// Hash of the newest applied entry of each row's chain
    audit_heads: HashMap<RowKey, String>,
    pending: Pending,
    next_audit_id: AuditId,
    next_seq: u64,
    commit_seq: u64,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
            state_keys: HashMap::new(),
            records: BTreeMap::new(),
            pairings: HashMap::new(),
            conflicts: BTreeMap::new(),
            audit: BTreeMap::new(),
            audit_by_record: HashMap::new(),
            audit_heads: HashMap::new(),
            pending: Pending::default(),
            next_audit_id: 1,
            next_seq: 1,
            commit_seq: 0,
        }
    }
}

fn row(table: &str, id: i64) -> RowKey {
    (table.to_string(), id)
}

impl Tables {
    pub fn state(&self, id: StateId) -> Option<&PresenceState> {
        self.states.get(&id)
    }

    pub fn find_state(
        &self,
        organization: OrganizationId,
        domain: &Domain,
        code: &str,
    ) -> Option<&PresenceState> {
        self.state_keys
            .get(&(organization, domain.clone(), code.to_string()))
            .and_then(|id| self.states.get(id))
    }

    /// States of one domain, in display order
    pub fn states_for(&self, organization: OrganizationId, domain: &Domain) -> Vec<PresenceState> {
        let mut states: Vec<PresenceState> = self
            .states
            .values()
            .filter(|s| s.organization == organization && &s.domain == domain)
            .cloned()
            .collect();
        states.sort_by_key(|s| (s.sort_order, s.id));
        states
    }

    /// Whether any record or conflict version points at the state, including
    /// commits still in flight
    pub fn state_in_use(&self, id: StateId) -> bool {
        self.pending.state_refs.contains_key(&id)
            || self.records.values().any(|r| r.state == id)
            || self
                .conflicts
                .values()
                .any(|c| c.version_a.state == id || c.version_b.state == id)
    }

    pub fn record(&self, id: RecordId) -> Option<&PresenceRecord> {
        self.records.get(&id)
    }

    pub fn record_for(&self, pairing: Pairing) -> Option<&PresenceRecord> {
        self.pairings
            .get(&pairing)
            .and_then(|id| self.records.get(id))
    }

    pub fn records_for_session(&self, session: SessionId) -> Vec<PresenceRecord> {
        self.records
            .values()
            .filter(|r| r.session == session)
            .cloned()
            .collect()
    }

    pub fn conflict(&self, id: ConflictId) -> Option<&SyncConflict> {
        self.conflicts.get(&id)
    }

    /// Open conflicts of an organization with id greater than `after`, oldest first
    pub fn open_conflicts_after(
        &self,
        organization: OrganizationId,
        after: Option<ConflictId>,
        limit: usize,
    ) -> Vec<SyncConflict> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.conflicts
            .range((lower, Bound::Unbounded))
            .map(|(_, c)| c)
            .filter(|c| c.organization == organization && !c.is_resolved())
            .take(limit)
            .cloned()
            .collect()
    }

    /// All conflicts ever recorded for a pairing, oldest first
    pub fn conflicts_for(&self, pairing: Pairing) -> Vec<SyncConflict> {
        self.conflicts
            .values()
            .filter(|c| c.pairing() == pairing)
            .cloned()
            .collect()
    }

    pub fn audit_entry(&self, id: AuditId) -> Option<&AuditLog> {
        self.audit.get(&id)
    }

    pub fn audit_len(&self) -> usize {
        self.audit.len()
    }

    /// Up to `limit` matching entries older than `before`, newest first
    pub fn audit_page(
        &self,
        filter: &AuditFilter,
        before: Option<AuditId>,
        limit: usize,
    ) -> Vec<AuditLog> {
        let upper = before.map_or(Bound::Unbounded, Bound::Excluded);
        match filter {
            AuditFilter::Record {
                table_name,
                record_id,
            } => self
                .audit_by_record
                .get(&(table_name.clone(), *record_id))
                .map(|ids| {
                    ids.iter()
                        .rev()
                        .filter(|id| before.map_or(true, |b| **id < b))
                        .filter_map(|id| self.audit.get(id))
                        .take(limit)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            AuditFilter::Organization {
                organization,
                since,
            } => self
                .audit
                .range((Bound::Unbounded, upper))
                .rev()
                .map(|(_, e)| e)
                .filter(|e| e.organization == *organization && e.changed_at >= *since)
                .take(limit)
                .cloned()
                .collect(),
        }
    }

    /// Up to `limit` entries with id greater than `after`, oldest first
    pub fn audit_range(&self, after: AuditId, limit: usize) -> Vec<AuditLog> {
        self.audit
            .range((Bound::Excluded(after), Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn validate(&self, tx: &Transaction) -> Result<()> {
        let mut staged_keys = HashSet::new();
        for state in &tx.states {
            let key = (state.organization, state.domain.clone(), state.code.clone());
            let clashes = self.state_keys.get(&key).map_or(false, |id| *id != state.id)
                || self.pending.state_keys.contains(&key);
            if clashes || !staged_keys.insert(key) {
                return Err(PresenceError::AlreadyExists(format!(
                    "presence state {}/{}/{}",
                    state.organization, state.domain, state.code
                )));
            }
        }

        for id in &tx.deleted_states {
            if !self.states.contains_key(id) || self.pending.deleted_states.contains(id) {
                return Err(PresenceError::NotFound(format!("presence state {}", id)));
            }
            if self.state_in_use(*id) {
                return Err(PresenceError::StateInUse(*id));
            }
        }

        let staged_states: HashSet<StateId> = tx.states.iter().map(|s| s.id).collect();
        let known_state = |id: &StateId| {
            (self.states.contains_key(id) && !self.pending.deleted_states.contains(id))
                || staged_states.contains(id)
        };
        let mut staged_pairings = HashSet::new();
        for record in &tx.records {
            let pairing = record.pairing();
            let clashes = self.pairings.get(&pairing).map_or(false, |id| *id != record.id)
                || self.pending.pairings.contains(&pairing);
            if clashes || !staged_pairings.insert(pairing) {
                return Err(PresenceError::AlreadyExists(format!(
                    "presence record for {}",
                    pairing
                )));
            }
            if !known_state(&record.state) {
                return Err(PresenceError::UnknownState(record.state_code.clone()));
            }
        }

        for conflict in &tx.conflicts {
            if let Some(existing) = self.conflicts.get(&conflict.id) {
                if existing.is_resolved() {
                    return Err(PresenceError::AlreadyResolved(conflict.id));
                }
            }
        }

        Ok(())
    }

    /// Rows a transaction writes, as named in the audit trail
    fn rows_of(tx: &Transaction) -> Vec<RowKey> {
        let mut rows: Vec<RowKey> = tx
            .states
            .iter()
            .map(|s| row(PRESENCE_STATES, s.id))
            .chain(tx.deleted_states.iter().map(|id| row(PRESENCE_STATES, *id)))
            .chain(tx.records.iter().map(|r| row(PRESENCE_RECORDS, r.id)))
            .chain(tx.conflicts.iter().map(|c| row(SYNC_CONFLICTS, c.id)))
            .chain(tx.audit.iter().map(|d| (d.table_name.clone(), d.record_id)))
            .collect();
        rows.sort();
        rows.dedup();
        rows
    }

    /// Validate, reserve and seal. Nothing becomes visible yet.
    fn prepare(&mut self, tx: Transaction) -> Result<Prepared> {
        self.validate(&tx)?;

        let rows = Self::rows_of(&tx);
        if let Some((table, id)) = rows.iter().find(|r| self.pending.rows.contains(*r)) {
            return Err(PresenceError::WriteInProgress(format!("{} {}", table, id)));
        }

        let now = Utc::now();
        let first_audit_id = self.next_audit_id;
        let mut heads: HashMap<RowKey, String> = HashMap::new();
        let mut audit = Vec::with_capacity(tx.audit.len());
        for draft in tx.audit {
            let key = (draft.table_name.clone(), draft.record_id);
            let prev_hash = heads
                .get(&key)
                .or_else(|| self.audit_heads.get(&key))
                .cloned()
                .unwrap_or_else(|| chain::GENESIS_HASH.to_string());
            let log = match AuditLog::seal(self.next_audit_id, draft, now, prev_hash) {
                Ok(log) => log,
                Err(e) => {
                    self.next_audit_id = first_audit_id;
                    return Err(e.into());
                }
            };
            heads.insert(key, log.entry_hash.clone());
            self.next_audit_id += 1;
            audit.push(log);
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let reservation = Reservation {
            pairings: tx.records.iter().map(|r| r.pairing()).collect(),
            state_keys: tx
                .states
                .iter()
                .map(|s| (s.organization, s.domain.clone(), s.code.clone()))
                .collect(),
            deleted_states: tx.deleted_states.clone(),
            state_refs: tx
                .records
                .iter()
                .map(|r| r.state)
                .chain(
                    tx.conflicts
                        .iter()
                        .flat_map(|c| [c.version_a.state, c.version_b.state]),
                )
                .collect(),
            rows,
            seq,
            audit_ids: first_audit_id..self.next_audit_id,
        };
        self.reserve(&reservation);

        Ok(Prepared {
            entry: CommitEntry {
                seq,
                committed_at: Some(now),
                states: tx.states,
                deleted_states: tx.deleted_states,
                records: tx.records,
                conflicts: tx.conflicts,
                audit,
            },
            reservation,
        })
    }

    fn reserve(&mut self, r: &Reservation) {
        self.pending.rows.extend(r.rows.iter().cloned());
        self.pending.pairings.extend(r.pairings.iter().copied());
        self.pending.state_keys.extend(r.state_keys.iter().cloned());
        self.pending.deleted_states.extend(r.deleted_states.iter().copied());
        for id in &r.state_refs {
            *self.pending.state_refs.entry(*id).or_default() += 1;
        }
    }

    fn release(&mut self, r: &Reservation, committed: bool) {
        for key in &r.rows {
            self.pending.rows.remove(key);
        }
        for pairing in &r.pairings {
            self.pending.pairings.remove(pairing);
        }
        for key in &r.state_keys {
            self.pending.state_keys.remove(key);
        }
        for id in &r.deleted_states {
            self.pending.deleted_states.remove(id);
        }
        for id in &r.state_refs {
            if let Some(count) = self.pending.state_refs.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    self.pending.state_refs.remove(id);
                }
            }
        }
        // Hand back the ids of a refused commit unless a later one took ids after it
        if !committed {
            if self.next_audit_id == r.audit_ids.end {
                self.next_audit_id = r.audit_ids.start;
            }
            if self.next_seq == r.seq + 1 {
                self.next_seq = r.seq;
            }
        }
    }

    fn apply(&mut self, entry: CommitEntry) {
        for state in entry.states {
            self.state_keys.insert(
                (state.organization, state.domain.clone(), state.code.clone()),
                state.id,
            );
            self.states.insert(state.id, state);
        }
        for id in entry.deleted_states {
            if let Some(state) = self.states.remove(&id) {
                self.state_keys
                    .remove(&(state.organization, state.domain, state.code));
            }
        }
        for record in entry.records {
            self.pairings.insert(record.pairing(), record.id);
            self.records.insert(record.id, record);
        }
        for conflict in entry.conflicts {
            self.conflicts.insert(conflict.id, conflict);
        }
        for log in entry.audit {
            let key = (log.table_name.clone(), log.record_id);
            self.audit_heads.insert(key.clone(), log.entry_hash.clone());
            self.audit_by_record.entry(key).or_default().push(log.id);
            self.next_audit_id = self.next_audit_id.max(log.id + 1);
            self.audit.insert(log.id, log);
        }
        self.commit_seq = self.commit_seq.max(entry.seq);
        self.next_seq = self.next_seq.max(entry.seq + 1);
    }
}

/// The authoritative store for one deployment.
pub struct PresenceStore {
    tables: Mutex<Tables>,
    journal: Box<dyn Journal>,
    /// Serializes [`PresenceStore::transact`] callers among themselves
    builders: Mutex<()>,
    state_seq: AtomicI64,
    record_seq: AtomicI64,
    conflict_seq: AtomicI64,
}

impl PresenceStore {
    /// A store backed by a fresh in-memory journal
    pub fn in_memory() -> Self {
        Self::with_tables(Tables::default(), Box::new(MemoryJournal::new()))
    }

    /// Open a store over `journal`, replaying every commit it holds.
    pub fn open(journal: impl Journal + 'static) -> Result<Self> {
        let mut tables = Tables::default();
        let entries = journal.replay()?;
        let count = entries.len();
        for entry in entries {
            tables.apply(entry);
        }
        log::info!(
            "Replayed {} commits ({} audit entries)",
            count,
            tables.audit.len()
        );
        Ok(Self::with_tables(tables, Box::new(journal)))
    }

    fn with_tables(tables: Tables, journal: Box<dyn Journal>) -> Self {
        let next = |max: Option<i64>| AtomicI64::new(max.unwrap_or(0) + 1);
        let state_seq = next(tables.states.keys().next_back().copied());
        let record_seq = next(tables.records.keys().next_back().copied());
        let conflict_seq = next(tables.conflicts.keys().next_back().copied());
        Self {
            tables: Mutex::new(tables),
            journal,
            builders: Mutex::new(()),
            state_seq,
            record_seq,
            conflict_seq,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Tables are only mutated by code that does not panic, so a poisoned
        // guard still holds consistent data.
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn next_state_id(&self) -> StateId {
        self.state_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_record_id(&self) -> RecordId {
        self.record_seq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_conflict_id(&self) -> ConflictId {
        self.conflict_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Run a read-only closure against the tables
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.lock())
    }

    /// Commit a staged transaction atomically.
    ///
    /// Blocks on the journal write; async callers should run it on a
    /// blocking thread.
    pub fn commit(&self, tx: Transaction) -> Result<CommitReceipt> {
        if tx.is_empty() {
            return Ok(CommitReceipt {
                seq: self.lock().commit_seq,
                audit_ids: Vec::new(),
            });
        }
        let prepared = self.lock().prepare(tx)?;
        self.settle(prepared)
    }

    /// Build and commit a transaction. Builders run one at a time and each
    /// sees the effects of the previous one, so get-or-create logic built on
    /// the tables is safe. Plain [`commit`](Self::commit) calls are not held
    /// up by builders.
    pub fn transact<T>(
        &self,
        build: impl FnOnce(&Tables) -> Result<(Transaction, T)>,
    ) -> Result<(CommitReceipt, T)> {
        let _builder = self
            .builders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (tx, value) = build(&self.lock())?;
        let receipt = self.commit(tx)?;
        Ok((receipt, value))
    }

    fn settle(&self, prepared: Prepared) -> Result<CommitReceipt> {
        let Prepared { entry, reservation } = prepared;
        let written = self.journal.append(&entry);

        let mut tables = self.lock();
        tables.release(&reservation, written.is_ok());
        if let Err(e) = written {
            log::warn!("Commit {} rejected by journal: {}", entry.seq, e);
            return Err(match e {
                PresenceError::StorageUnavailable(_) => e,
                other => PresenceError::StorageUnavailable(other.to_string()),
            });
        }

        let receipt = CommitReceipt {
            seq: entry.seq,
            audit_ids: entry.audit.iter().map(|a| a.id).collect(),
        };
        log::debug!(
            "Committed #{}: {} records, {} conflicts, {} audit entries",
            entry.seq,
            entry.records.len(),
            entry.conflicts.len(),
            entry.audit.len()
        );
        tables.apply(entry);
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditDraft, PRESENCE_RECORDS};
    use serde_json::json;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    struct FailingJournal;

    /// Holds its first append until the test lets it through
    struct GatedJournal {
        inner: MemoryJournal,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl Journal for GatedJournal {
        fn append(&self, entry: &CommitEntry) -> Result<()> {
            let entered = self.entered.lock().unwrap().take();
            if let Some(entered) = entered {
                entered.send(()).unwrap();
                let release = self.release.lock().unwrap().take();
                if let Some(release) = release {
                    release.recv().unwrap();
                }
            }
            self.inner.append(entry)
        }

        fn replay(&self) -> Result<Vec<CommitEntry>> {
            self.inner.replay()
        }
    }

    fn audited(row_id: i64) -> Transaction {
        let mut tx = Transaction::new();
        tx.audit(AuditDraft::new(1, PRESENCE_RECORDS, row_id, AuditAction::Update));
        tx
    }

    impl Journal for FailingJournal {
        fn append(&self, _entry: &CommitEntry) -> Result<()> {
            Err(PresenceError::StorageUnavailable("disk full".into()))
        }

        fn replay(&self) -> Result<Vec<CommitEntry>> {
            Ok(Vec::new())
        }
    }

    fn state(store: &PresenceStore, code: &str) -> PresenceState {
        PresenceState {
            id: store.next_state_id(),
            organization: 1,
            domain: Domain::Education,
            code: code.to_string(),
            label: code.to_string(),
            color: "#00ff00".to_string(),
            sort_order: 0,
            is_default: false,
            created_at: Utc::now(),
        }
    }

    fn record(store: &PresenceStore, state: &PresenceState, participant: i64) -> PresenceRecord {
        let now = Utc::now();
        PresenceRecord {
            id: store.next_record_id(),
            organization: 1,
            session: 10,
            participant,
            state: state.id,
            state_code: state.code.clone(),
            recorded_at: now,
            recorded_by: None,
            source_device: None,
            submission: None,
            extra_data: json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_commit_applies_rows_and_audit() {
        let store = PresenceStore::in_memory();
        let present = state(&store, "present");
        let rec = record(&store, &present, 5);

        let mut tx = Transaction::new();
        tx.put_state(present.clone());
        tx.put_record(rec.clone());
        tx.audit(AuditDraft::new(1, PRESENCE_RECORDS, rec.id, AuditAction::Create));
        let receipt = store.commit(tx).unwrap();

        assert_eq!(receipt.audit_ids, vec![1]);
        store.read(|t| {
            assert_eq!(t.record_for(Pairing::new(10, 5)), Some(&rec));
            assert_eq!(t.audit_len(), 1);
            assert_eq!(t.audit_entry(1).unwrap().prev_hash, chain::GENESIS_HASH);
        });
    }

    #[test]
    fn test_failed_journal_leaves_no_partial_state() {
        let store = PresenceStore::open(FailingJournal).unwrap();
        let present = state(&store, "present");
        let rec = record(&store, &present, 5);

        let mut tx = Transaction::new();
        tx.put_state(present);
        tx.put_record(rec.clone());
        tx.audit(AuditDraft::new(1, PRESENCE_RECORDS, rec.id, AuditAction::Create));

        let err = store.commit(tx).unwrap_err();
        assert!(matches!(err, PresenceError::StorageUnavailable(_)));
        store.read(|t| {
            assert!(t.record_for(Pairing::new(10, 5)).is_none());
            assert_eq!(t.audit_len(), 0);
        });
    }

    #[test]
    fn test_duplicate_pairing_rejected() {
        let store = PresenceStore::in_memory();
        let present = state(&store, "present");
        let mut tx = Transaction::new();
        tx.put_state(present.clone());
        tx.put_record(record(&store, &present, 5));
        store.commit(tx).unwrap();

        let mut tx = Transaction::new();
        tx.put_record(record(&store, &present, 5));
        let err = store.commit(tx).unwrap_err();
        assert!(matches!(err, PresenceError::AlreadyExists(_)));
    }

    #[test]
    fn test_duplicate_state_tuple_rejected() {
        let store = PresenceStore::in_memory();
        let mut tx = Transaction::new();
        tx.put_state(state(&store, "late"));
        store.commit(tx).unwrap();

        let mut tx = Transaction::new();
        tx.put_state(state(&store, "late"));
        assert!(matches!(
            store.commit(tx),
            Err(PresenceError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_referenced_state_cannot_be_deleted() {
        let store = PresenceStore::in_memory();
        let present = state(&store, "present");
        let unused = state(&store, "unused");
        let mut tx = Transaction::new();
        tx.put_state(present.clone());
        tx.put_state(unused.clone());
        tx.put_record(record(&store, &present, 5));
        store.commit(tx).unwrap();

        let mut tx = Transaction::new();
        tx.delete_state(present.id);
        assert!(matches!(store.commit(tx), Err(PresenceError::StateInUse(_))));

        let mut tx = Transaction::new();
        tx.delete_state(unused.id);
        store.commit(tx).unwrap();
        store.read(|t| assert!(t.state(unused.id).is_none()));
    }

    #[test]
    fn test_reopen_replays_journal_and_sequences() {
        let journal = Arc::new(MemoryJournal::new());
        let (present, rec) = {
            let store = PresenceStore::open(journal.clone()).unwrap();
            let present = state(&store, "present");
            let rec = record(&store, &present, 5);
            let mut tx = Transaction::new();
            tx.put_state(present.clone());
            tx.put_record(rec.clone());
            tx.audit(AuditDraft::new(1, PRESENCE_RECORDS, rec.id, AuditAction::Create));
            store.commit(tx).unwrap();
            (present, rec)
        };

        let store = PresenceStore::open(journal).unwrap();
        store.read(|t| {
            assert_eq!(t.state(present.id), Some(&present));
            assert_eq!(t.record(rec.id), Some(&rec));
            assert_eq!(t.audit_len(), 1);
        });
        assert!(store.next_record_id() > rec.id);
        assert!(store.next_state_id() > present.id);
    }

    #[test]
    fn test_transact_builds_under_lock() {
        let store = PresenceStore::in_memory();
        let (_, created) = store
            .transact(|tables| {
                let mut tx = Transaction::new();
                let exists = tables.find_state(1, &Domain::Education, "present").is_some();
                if !exists {
                    tx.put_state(state(&store, "present"));
                }
                Ok((tx, !exists))
            })
            .unwrap();
        assert!(created);
    }

    #[test]
    fn test_audit_page_newest_first() {
        let store = PresenceStore::in_memory();
        for n in 0..5 {
            let mut tx = Transaction::new();
            tx.audit(AuditDraft::new(1, PRESENCE_RECORDS, 1, AuditAction::Update).new_values(json!({"n": n})));
            store.commit(tx).unwrap();
        }
        let filter = AuditFilter::Record {
            table_name: PRESENCE_RECORDS.to_string(),
            record_id: 1,
        };
        store.read(|t| {
            let page = t.audit_page(&filter, None, 2);
            assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 4]);
            let page = t.audit_page(&filter, Some(4), 10);
            assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 2, 1]);
        });
    }

    #[test]
    fn test_journal_write_does_not_hold_other_rows() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(
            PresenceStore::open(GatedJournal {
                inner: MemoryJournal::new(),
                entered: Mutex::new(Some(entered_tx)),
                release: Mutex::new(Some(release_rx)),
            })
            .unwrap(),
        );

        let slow = {
            let store = store.clone();
            thread::spawn(move || store.commit(audited(1)))
        };
        entered_rx.recv().unwrap();

        // Row 1 is still waiting on the journal; row 2 goes straight through
        let receipt = store.commit(audited(2)).unwrap();
        assert_eq!(receipt.audit_ids, vec![2]);
        assert!(store.read(|t| t.audit_entry(1).is_none()));
        assert!(matches!(
            store.commit(audited(1)),
            Err(PresenceError::WriteInProgress(_))
        ));

        release_tx.send(()).unwrap();
        assert_eq!(slow.join().unwrap().unwrap().audit_ids, vec![1]);
        store.read(|t| {
            assert_eq!(t.audit_len(), 2);
            assert_eq!(t.audit_entry(1).unwrap().prev_hash, chain::GENESIS_HASH);
            assert_eq!(t.audit_entry(2).unwrap().prev_hash, chain::GENESIS_HASH);
        });
        store.commit(audited(1)).unwrap();
        let third = store.read(|t| t.audit_entry(3).cloned()).unwrap();
        let first = store.read(|t| t.audit_entry(1).cloned()).unwrap();
        assert_eq!(third.prev_hash, first.entry_hash);
    }

    #[test]
    fn test_refused_commit_hands_back_audit_ids() {
        let store = PresenceStore::open(FailingJournal).unwrap();
        assert!(store.commit(audited(1)).is_err());
        assert!(store.commit(audited(1)).is_err());
        store.read(|t| {
            assert_eq!(t.next_audit_id, 1);
            assert!(t.pending.rows.is_empty());
        });
    }

    #[test]
    fn test_gap_left_by_refused_commit_still_verifies() {
        let store = PresenceStore::in_memory();
        let (first, second) = {
            let mut tables = store.lock();
            let first = tables.prepare(audited(1)).unwrap();
            let second = tables.prepare(audited(2)).unwrap();
            (first, second)
        };
        // The first commit never reaches the journal; the second does
        store.lock().release(&first.reservation, false);
        store.settle(second).unwrap();

        store.read(|t| {
            assert!(t.audit_entry(1).is_none());
            let mut verifier = chain::ChainVerifier::new();
            for entry in t.audit_range(0, 10) {
                verifier.check(&entry).unwrap();
            }
            assert_eq!(verifier.verified(), 1);
        });
        assert_eq!(store.commit(audited(1)).unwrap().audit_ids, vec![3]);
    }
}
