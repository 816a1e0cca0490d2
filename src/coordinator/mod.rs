//! Presence Write Coordinator
//!
//! Every presence write enters here. A write is validated against the
//! directory and the state registry, then classified against the pairing's
//! authoritative record and committed together with its audit entry in a
//! single transaction. Writes and resolutions touching the same pairing are
//! serialized by a per-pairing lock; different pairings never wait on each
//! other. Commits block on the journal, so they run on tokio's blocking pool
//! and never stall the async workers.

mod locks;
mod policy;
mod submission;

pub use locks::PairingLocks;
pub use policy::{ReconciliationWindow, WriteDecision};
pub use submission::{
    ConflictRef, Outcome, PairingStatus, RejectedRecord, SessionSummary, Submission, SyncRecord,
    SyncRequest, SyncResponse,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditDraft, AuditTrail, PRESENCE_RECORDS, SYNC_CONFLICTS};
use crate::config::EngineConfig;
use crate::conflict::{ConflictStore, Resolution, ResolvedWith, SyncConflict, VersionPayload};
use crate::directory::{Directory, SessionScope};
use crate::error::{ErrorKind, PresenceError, Result};
use crate::events::{EventHub, EventKind, EventSink, PresenceEvent};
use crate::model::{
    ActorId, ConflictId, DeviceId, Domain, OrganizationId, Pairing, PresenceRecord, PresenceState,
    SessionId, StateId,
};
use crate::registry::PresenceStateRegistry;
use crate::store::{CommitReceipt, PresenceStore, Tables, Transaction};

/// The values a commit writes into a presence record
struct RecordWrite {
    state: StateId,
    state_code: String,
    actor: Option<ActorId>,
    device: Option<DeviceId>,
    submission: Option<Uuid>,
    at: DateTime<Utc>,
    extra_data: Value,
}

impl RecordWrite {
    fn submitted(state: &PresenceState, submission: &Submission) -> Self {
        Self {
            state: state.id,
            state_code: state.code.clone(),
            actor: submission.actor,
            device: submission.device.clone(),
            submission: Some(submission.id),
            at: submission.submitted_at,
            extra_data: submission.extra_data.clone(),
        }
    }

    fn chosen(version: &VersionPayload, resolver: Option<ActorId>) -> Self {
        Self {
            state: version.state,
            state_code: version.state_code.clone(),
            actor: resolver,
            device: version.device.clone(),
            submission: version.submission,
            at: version.submitted_at,
            extra_data: version.extra_data.clone(),
        }
    }
}

fn state_snapshot(code: &str) -> Value {
    json!({ "presence_state": code })
}

type Planned<T> = (T, Vec<PresenceEvent>);
type Plan<T> = (Transaction, Planned<T>);

/// Run blocking store work off the async worker threads.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PresenceError::StorageUnavailable(format!("storage task failed: {}", e)))?
}

pub struct PresenceWriteCoordinator {
    store: Arc<PresenceStore>,
    directory: Arc<dyn Directory>,
    registry: Arc<PresenceStateRegistry>,
    conflicts: ConflictStore,
    audit: AuditTrail,
    events: EventHub,
    locks: PairingLocks,
    window: ReconciliationWindow,
    allow_override: bool,
}

impl PresenceWriteCoordinator {
    pub fn new(
        store: Arc<PresenceStore>,
        directory: Arc<dyn Directory>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry: Arc::new(PresenceStateRegistry::new(
                store.clone(),
                config.state_cache_ttl(),
            )),
            conflicts: ConflictStore::new(store.clone()),
            audit: AuditTrail::new(store.clone()),
            events: EventHub::new(config.event_buffer),
            locks: PairingLocks::new(),
            window: ReconciliationWindow::new(config.reconciliation_window()),
            allow_override: config.allow_override_resolution,
            store,
            directory,
        }
    }

    pub fn store(&self) -> &Arc<PresenceStore> {
        &self.store
    }

    pub fn registry(&self) -> &PresenceStateRegistry {
        &self.registry
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    pub fn window(&self) -> ReconciliationWindow {
        self.window
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.events.add_sink(sink);
    }

    /// Organization and domain of a pairing, checked against the directory.
    pub fn scope(&self, pairing: Pairing) -> Result<SessionScope> {
        let session = self
            .directory
            .session(pairing.session)
            .ok_or(PresenceError::UnknownSession(pairing.session))?;
        let participant = self
            .directory
            .participant(pairing.participant)
            .ok_or(PresenceError::UnknownParticipant(pairing.participant))?;
        if participant.organization != session.organization {
            return Err(PresenceError::ScopeMismatch {
                session: pairing.session,
                participant: pairing.participant,
            });
        }
        Ok(session)
    }

    pub fn record_for(&self, pairing: Pairing) -> Option<PresenceRecord> {
        self.store.read(|t| t.record_for(pairing).cloned())
    }

    pub fn pairing_status(&self, pairing: Pairing) -> PairingStatus {
        if !self.conflicts.open_for(pairing).is_empty() {
            PairingStatus::Conflicted
        } else if self.record_for(pairing).is_some() {
            PairingStatus::Recorded
        } else {
            PairingStatus::NoRecord
        }
    }

    async fn commit(&self, tx: Transaction) -> Result<CommitReceipt> {
        let store = self.store.clone();
        blocking(move || store.commit(tx)).await
    }

    /// Resolve a state code, materializing the domain defaults on the
    /// blocking pool when they are not stored yet.
    async fn state_for(
        &self,
        organization: OrganizationId,
        domain: &Domain,
        code: &str,
    ) -> Result<PresenceState> {
        if let Some(state) = self.registry.cached_state(organization, domain, code)? {
            return Ok(state);
        }
        let registry = self.registry.clone();
        let (domain, code) = (domain.clone(), code.to_string());
        blocking(move || registry.resolve_state(organization, &domain, &code)).await
    }

    /// Accept one presence write.
    ///
    /// Validation failures leave no trace. Once validated, the read of the
    /// current record, the classification and the resulting commit happen
    /// while holding the pairing's lock.
    pub async fn submit(&self, submission: Submission) -> Result<Outcome> {
        let pairing = submission.pairing();
        let scope = self.scope(pairing)?;
        let state = self
            .state_for(scope.organization, &scope.domain, &submission.state_code)
            .await?;

        let guard = self.locks.acquire(pairing).await;
        let result = match self.store.read(|tables| {
            self.plan_submission(tables, scope.organization, &state, &submission)
        }) {
            Ok((tx, planned)) => self.commit(tx).await.map(|_| planned),
            Err(e) => Err(e),
        };
        drop(guard);

        let (outcome, events) = result?;
        self.events.publish(events);
        Ok(outcome)
    }

    fn plan_submission(
        &self,
        tables: &Tables,
        organization: OrganizationId,
        state: &PresenceState,
        submission: &Submission,
    ) -> Result<Plan<Outcome>> {
        let pairing = submission.pairing();
        let existing = tables.record_for(pairing).cloned();
        let decision = self.window.classify(
            existing.as_ref(),
            state.id,
            submission.device.as_ref(),
            submission.submitted_at,
        );
        let write = RecordWrite::submitted(state, submission);
        let mut tx = Transaction::new();

        let planned = match (decision, existing) {
            (WriteDecision::Create, _) | (_, None) => {
                let record = self.create_record(&mut tx, organization, pairing, &write, None);
                let event = PresenceEvent::new(
                    organization,
                    EventKind::RecordCreated,
                    PRESENCE_RECORDS,
                    record.id,
                    format!("{}: {}", pairing, record.state_code),
                );
                (Outcome::Created { record: record.id }, vec![event])
            }
            (WriteDecision::Unchanged, Some(mut record)) => {
                let id = record.id;
                // Only the device that wrote the record may move its timestamp
                if write.device == record.source_device && write.at > record.recorded_at {
                    record.recorded_at = write.at;
                    record.updated_at = Utc::now();
                    tx.put_record(record);
                }
                (Outcome::Unchanged { record: id }, Vec::new())
            }
            (WriteDecision::Apply, Some(record)) => {
                let previous = record.state_code.clone();
                let record = self.update_record(&mut tx, record, &write, None);
                let event = PresenceEvent::new(
                    organization,
                    EventKind::RecordUpdated,
                    PRESENCE_RECORDS,
                    record.id,
                    format!("{}: {} -> {}", pairing, previous, record.state_code),
                );
                (Outcome::Updated { record: record.id }, vec![event])
            }
            (WriteDecision::Stale, Some(record)) => {
                log::info!(
                    "Dropped stale write {} for {} ({} at {}, record holds {} at {})",
                    submission.id,
                    pairing,
                    write.state_code,
                    write.at,
                    record.state_code,
                    record.recorded_at
                );
                (Outcome::Stale { record: record.id }, Vec::new())
            }
            (WriteDecision::Conflict, Some(record)) => {
                let conflict = self.stage_conflict(&mut tx, &record, state, submission);
                log::info!(
                    "Conflict {} on {}: {} ({:?}) vs {} ({:?})",
                    conflict.id,
                    pairing,
                    conflict.version_a.state_code,
                    conflict.version_a.device,
                    conflict.version_b.state_code,
                    conflict.version_b.device
                );
                let event = PresenceEvent::new(
                    organization,
                    EventKind::ConflictDetected,
                    SYNC_CONFLICTS,
                    conflict.id,
                    format!(
                        "{}: {} or {}",
                        pairing, conflict.version_a.state_code, conflict.version_b.state_code
                    ),
                );
                (
                    Outcome::Conflicted {
                        record: record.id,
                        conflict: conflict.id,
                    },
                    vec![event],
                )
            }
        };
        Ok((tx, planned))
    }

    fn create_record(
        &self,
        tx: &mut Transaction,
        organization: OrganizationId,
        pairing: Pairing,
        write: &RecordWrite,
        conflict: Option<ConflictId>,
    ) -> PresenceRecord {
        let now = Utc::now();
        let record = PresenceRecord {
            id: self.store.next_record_id(),
            organization,
            session: pairing.session,
            participant: pairing.participant,
            state: write.state,
            state_code: write.state_code.clone(),
            recorded_at: write.at,
            recorded_by: write.actor,
            source_device: write.device.clone(),
            submission: write.submission,
            extra_data: if write.extra_data.is_null() {
                json!({})
            } else {
                write.extra_data.clone()
            },
            created_at: now,
            updated_at: now,
        };

        let mut draft = AuditDraft::new(organization, PRESENCE_RECORDS, record.id, AuditAction::Create)
            .changed_by(write.actor)
            .new_values(record.creation_snapshot())
            .source_device(write.device.clone());
        if let Some(conflict) = conflict {
            draft = draft.conflict(conflict);
        }
        tx.audit(draft);
        tx.put_record(record.clone());
        record
    }

    fn update_record(
        &self,
        tx: &mut Transaction,
        mut record: PresenceRecord,
        write: &RecordWrite,
        conflict: Option<ConflictId>,
    ) -> PresenceRecord {
        let mut draft = AuditDraft::new(
            record.organization,
            PRESENCE_RECORDS,
            record.id,
            AuditAction::Update,
        )
        .changed_by(write.actor)
        .old_values(state_snapshot(&record.state_code))
        .new_values(state_snapshot(&write.state_code))
        .source_device(write.device.clone());
        if let Some(conflict) = conflict {
            draft = draft.conflict(conflict);
        }
        tx.audit(draft);

        record.state = write.state;
        record.state_code = write.state_code.clone();
        record.recorded_at = record.recorded_at.max(write.at);
        record.recorded_by = write.actor;
        record.source_device = write.device.clone();
        record.submission = write.submission;
        if !write.extra_data.is_null() {
            record.extra_data = write.extra_data.clone();
        }
        record.updated_at = Utc::now();
        tx.put_record(record.clone());
        record
    }

    /// Stage a conflict between the record's current write and an incoming one,
    /// plus the audit entry announcing it. The record itself is not touched.
    fn stage_conflict(
        &self,
        tx: &mut Transaction,
        record: &PresenceRecord,
        state: &PresenceState,
        submission: &Submission,
    ) -> SyncConflict {
        let version_a = VersionPayload {
            submission: record.submission,
            state: record.state,
            state_code: record.state_code.clone(),
            device: record.source_device.clone(),
            actor: record.recorded_by,
            submitted_at: record.recorded_at,
            extra_data: record.extra_data.clone(),
        };
        let version_b = VersionPayload {
            submission: Some(submission.id),
            state: state.id,
            state_code: state.code.clone(),
            device: submission.device.clone(),
            actor: submission.actor,
            submitted_at: submission.submitted_at,
            extra_data: submission.extra_data.clone(),
        };
        let conflict = self.conflicts.record_conflict(
            tx,
            record.organization,
            record.pairing(),
            version_a,
            version_b,
        );

        tx.audit(
            AuditDraft::new(
                record.organization,
                PRESENCE_RECORDS,
                record.id,
                AuditAction::Update,
            )
            .changed_by(submission.actor)
            .old_values(state_snapshot(&record.state_code))
            .new_values(json!({
                "presence_state": record.state_code,
                "proposed_state": state.code,
                "conflict_id": conflict.id,
            }))
            .source_device(submission.device.clone())
            .conflict(conflict.id),
        );
        conflict
    }

    /// Close an open conflict by applying the chosen version as the
    /// authoritative record.
    pub async fn resolve(
        &self,
        conflict_id: ConflictId,
        resolution: Resolution,
        actor: Option<ActorId>,
    ) -> Result<PresenceRecord> {
        let conflict = self
            .conflicts
            .get(conflict_id)
            .ok_or_else(|| PresenceError::NotFound(format!("sync conflict {}", conflict_id)))?;
        if conflict.is_resolved() {
            return Err(PresenceError::AlreadyResolved(conflict_id));
        }
        let (resolved_with, write) = self.choose(&conflict, resolution, actor).await?;
        let pairing = conflict.pairing();

        let guard = self.locks.acquire(pairing).await;
        let planned = self.store.read(|tables| -> Result<Plan<PresenceRecord>> {
            // Re-read under the lock: a concurrent resolution may have won.
            let conflict = tables.conflict(conflict_id).cloned().ok_or_else(|| {
                PresenceError::NotFound(format!("sync conflict {}", conflict_id))
            })?;
            let mut tx = Transaction::new();
            let resolved = self.conflicts.mark_resolved(
                &mut tx,
                &conflict,
                resolved_with.clone(),
                actor,
                Utc::now(),
            )?;
            let organization = resolved.organization;
            let mut events = vec![PresenceEvent::new(
                organization,
                EventKind::ConflictResolved,
                SYNC_CONFLICTS,
                conflict_id,
                format!("{}: resolved with {}", pairing, write.state_code),
            )];

            let record = match tables.record_for(pairing).cloned() {
                None => {
                    let record =
                        self.create_record(&mut tx, organization, pairing, &write, Some(conflict_id));
                    events.push(PresenceEvent::new(
                        organization,
                        EventKind::RecordCreated,
                        PRESENCE_RECORDS,
                        record.id,
                        format!("{}: {}", pairing, record.state_code),
                    ));
                    record
                }
                Some(record) if record.state != write.state => {
                    let previous = record.state_code.clone();
                    let record = self.update_record(&mut tx, record, &write, Some(conflict_id));
                    events.push(PresenceEvent::new(
                        organization,
                        EventKind::RecordUpdated,
                        PRESENCE_RECORDS,
                        record.id,
                        format!("{}: {} -> {}", pairing, previous, record.state_code),
                    ));
                    record
                }
                Some(mut record) => {
                    // State already matches; only provenance moves.
                    record.recorded_by = write.actor;
                    record.source_device = write.device.clone();
                    record.updated_at = Utc::now();
                    tx.put_record(record.clone());
                    record
                }
            };
            Ok((tx, (record, events)))
        });
        let result = match planned {
            Ok((tx, planned)) => self.commit(tx).await.map(|_| planned),
            Err(e) => Err(e),
        };
        drop(guard);

        let (record, events) = result?;
        log::info!(
            "Resolved conflict {} on {} with {} ({})",
            conflict_id,
            pairing,
            resolved_with.label(),
            record.state_code
        );
        self.events.publish(events);
        Ok(record)
    }

    async fn choose(
        &self,
        conflict: &SyncConflict,
        resolution: Resolution,
        actor: Option<ActorId>,
    ) -> Result<(ResolvedWith, RecordWrite)> {
        match resolution {
            Resolution::VersionA => Ok((
                ResolvedWith::VersionA,
                RecordWrite::chosen(&conflict.version_a, actor),
            )),
            Resolution::VersionB => Ok((
                ResolvedWith::VersionB,
                RecordWrite::chosen(&conflict.version_b, actor),
            )),
            Resolution::Override { state_code } => {
                if !self.allow_override {
                    return Err(PresenceError::InvalidChoice(
                        "override resolutions are disabled".into(),
                    ));
                }
                let domain = self
                    .store
                    .read(|t| t.state(conflict.version_a.state).map(|s| s.domain.clone()))
                    .ok_or_else(|| {
                        PresenceError::NotFound(format!(
                            "presence state {}",
                            conflict.version_a.state
                        ))
                    })?;
                let state = match self
                    .state_for(conflict.organization, &domain, &state_code)
                    .await
                {
                    Ok(state) => state,
                    Err(e) if e.kind() == ErrorKind::Validation => {
                        return Err(PresenceError::InvalidChoice(format!(
                            "{:?} is not a presence state of {}",
                            state_code, domain
                        )))
                    }
                    Err(e) => return Err(e),
                };
                let write = RecordWrite {
                    state: state.id,
                    state_code: state.code.clone(),
                    actor,
                    device: None,
                    submission: None,
                    at: Utc::now(),
                    extra_data: Value::Null,
                };
                Ok((
                    ResolvedWith::Override {
                        state: state.id,
                        state_code: state.code,
                    },
                    write,
                ))
            }
        }
    }

    /// Apply an offline batch from one device, oldest write first.
    ///
    /// Each record is its own transaction. A record failing validation is
    /// reported in `rejected` and the batch carries on; a storage failure
    /// aborts the batch; records already applied stay applied and a retry of
    /// the batch reports them as unchanged.
    pub async fn sync_batch(&self, request: SyncRequest) -> Result<SyncResponse> {
        let batch = Uuid::new_v4();
        log::info!(
            "Sync batch {} from device {}: {} records",
            batch,
            request.device_id,
            request.records.len()
        );

        let mut order: Vec<usize> = (0..request.records.len()).collect();
        order.sort_by_key(|&i| request.records[i].recorded_at);

        let mut response = SyncResponse::default();
        for index in order {
            let record = &request.records[index];
            let mut submission = Submission::new(
                record.session_id,
                record.participant_id,
                record.presence_state_code.clone(),
                record.recorded_at,
            )
            .from_device(request.device_id.clone())
            .with_extra(record.extra_data.clone());
            submission.actor = request.actor;

            match self.submit(submission).await {
                Ok(Outcome::Created { .. }) | Ok(Outcome::Updated { .. }) => response.synced += 1,
                Ok(Outcome::Unchanged { .. }) => response.unchanged += 1,
                Ok(Outcome::Stale { .. }) => response.stale += 1,
                Ok(Outcome::Conflicted { conflict, .. }) => response.conflicts.push(ConflictRef {
                    session_id: record.session_id,
                    participant_id: record.participant_id,
                    conflict_id: conflict,
                }),
                Err(e) if e.kind() == ErrorKind::Validation => {
                    log::warn!("Sync batch {} rejected record {}: {}", batch, index, e);
                    response.rejected.push(RejectedRecord {
                        index,
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    log::warn!("Sync batch {} aborted at record {}: {}", batch, index, e);
                    return Err(e);
                }
            }
        }

        log::debug!(
            "Sync batch {} done: {} synced, {} unchanged, {} stale, {} conflicts, {} rejected",
            batch,
            response.synced,
            response.unchanged,
            response.stale,
            response.conflicts.len(),
            response.rejected.len()
        );
        Ok(response)
    }

    pub fn session_summary(&self, session: SessionId) -> Result<SessionSummary> {
        if self.directory.session(session).is_none() {
            return Err(PresenceError::UnknownSession(session));
        }
        let mut summary = SessionSummary {
            session,
            ..SessionSummary::default()
        };
        for record in self.store.read(|t| t.records_for_session(session)) {
            summary.total += 1;
            *summary.by_state.entry(record.state_code).or_default() += 1;
        }
        summary.present = summary.by_state.get("present").copied().unwrap_or(0);
        summary.absent = summary.total - summary.present;
        Ok(summary)
    }
}
