//! Write requests and their outcomes

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{ActorId, ConflictId, DeviceId, Pairing, ParticipantId, RecordId, SessionId};

/// One requested presence write, from a device or an operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub session: SessionId,
    pub participant: ParticipantId,
    pub state_code: String,
    pub actor: Option<ActorId>,
    /// `None` for writes made directly on the server
    pub device: Option<DeviceId>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub extra_data: Value,
}

impl Submission {
    pub fn new(
        session: SessionId,
        participant: ParticipantId,
        state_code: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            participant,
            state_code: state_code.into(),
            actor: None,
            device: None,
            submitted_at,
            extra_data: Value::Null,
        }
    }

    pub fn by(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn from_device(mut self, device: impl Into<DeviceId>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra_data = extra;
        self
    }

    pub fn pairing(&self) -> Pairing {
        Pairing::new(self.session, self.participant)
    }
}

/// What happened to a submission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Created { record: RecordId },
    Updated { record: RecordId },
    /// Same state as the record already holds; nothing audited
    Unchanged { record: RecordId },
    /// Superseded by a newer write and dropped
    Stale { record: RecordId },
    /// Held for manual resolution; the record is untouched
    Conflicted { record: RecordId, conflict: ConflictId },
}

impl Outcome {
    pub fn record(&self) -> RecordId {
        match self {
            Outcome::Created { record }
            | Outcome::Updated { record }
            | Outcome::Unchanged { record }
            | Outcome::Stale { record }
            | Outcome::Conflicted { record, .. } => *record,
        }
    }

    pub fn conflict(&self) -> Option<ConflictId> {
        match self {
            Outcome::Conflicted { conflict, .. } => Some(*conflict),
            _ => None,
        }
    }
}

/// One record of an offline batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub presence_state_code: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub extra_data: Value,
}

/// Batch of writes captured by one device while offline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub device_id: DeviceId,
    #[serde(default)]
    pub actor: Option<ActorId>,
    pub records: Vec<SyncRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRef {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub conflict_id: ConflictId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// Position of the record in the request
    pub index: usize,
    pub code: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub synced: usize,
    pub unchanged: usize,
    pub stale: usize,
    pub conflicts: Vec<ConflictRef>,
    pub rejected: Vec<RejectedRecord>,
}

/// Head count of one session by state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: SessionId,
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub by_state: BTreeMap<String, usize>,
}

/// Where a pairing is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    NoRecord,
    Recorded,
    /// At least one conflict awaits resolution. The pairing may or may not
    /// have a record yet.
    Conflicted,
}
