use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    ActorId, DeviceId, Domain, OrganizationId, Pairing, ParticipantId, RecordId, SessionId,
    StateId,
};

/// One named attendance status within a domain ("present", "late", ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub id: StateId,
    pub organization: OrganizationId,
    pub domain: Domain,
    /// Stable machine key, unique per (organization, domain)
    pub code: String,
    pub label: String,
    /// Hex color for display
    pub color: String,
    pub sort_order: i32,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// The authoritative current presence of one participant in one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: RecordId,
    pub organization: OrganizationId,
    pub session: SessionId,
    pub participant: ParticipantId,
    pub state: StateId,
    pub state_code: String,
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: Option<ActorId>,
    pub source_device: Option<DeviceId>,
    /// Submission that last wrote the record
    #[serde(default)]
    pub submission: Option<Uuid>,
    #[serde(default)]
    pub extra_data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn pairing(&self) -> Pairing {
        Pairing::new(self.session, self.participant)
    }

    /// Snapshot written to the audit trail when the record is created.
    pub fn creation_snapshot(&self) -> Value {
        json!({
            "session_id": self.session,
            "participant_id": self.participant,
            "presence_state": self.state_code,
        })
    }
}
