//! Sync conflict data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::model::{
    ActorId, ConflictId, DeviceId, OrganizationId, Pairing, ParticipantId, SessionId, StateId,
};

/// One competing write: the requested state plus submission metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionPayload {
    /// Submission that carried the write, when known
    pub submission: Option<Uuid>,
    pub state: StateId,
    pub state_code: String,
    pub device: Option<DeviceId>,
    pub actor: Option<ActorId>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub extra_data: Value,
}

/// Which version a resolver picks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "choice")]
pub enum Resolution {
    VersionA,
    VersionB,
    /// A third value chosen by the resolver
    Override { state_code: String },
}

/// Resolution marker stored on a conflict once it is closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "choice")]
pub enum ResolvedWith {
    VersionA,
    VersionB,
    Override { state: StateId, state_code: String },
}

impl ResolvedWith {
    pub fn state_code(&self, conflict: &SyncConflict) -> String {
        match self {
            ResolvedWith::VersionA => conflict.version_a.state_code.clone(),
            ResolvedWith::VersionB => conflict.version_b.state_code.clone(),
            ResolvedWith::Override { state_code, .. } => state_code.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResolvedWith::VersionA => "version_a",
            ResolvedWith::VersionB => "version_b",
            ResolvedWith::Override { .. } => "override",
        }
    }
}

/// A divergence between two writes for the same pairing, waiting for a human.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub organization: OrganizationId,
    pub session: SessionId,
    pub participant: ParticipantId,
    pub version_a: VersionPayload,
    pub version_b: VersionPayload,
    pub resolved_with: Option<ResolvedWith>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<ActorId>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolved_with.is_some()
    }

    pub fn pairing(&self) -> Pairing {
        Pairing::new(self.session, self.participant)
    }

    pub(crate) fn snapshot(&self) -> Value {
        json!({
            "session_id": self.session,
            "participant_id": self.participant,
            "version_a": self.version_a.state_code,
            "version_b": self.version_b.state_code,
            "resolution": self.resolved_with.as_ref().map(|r| r.label()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_wire_format() {
        let json = serde_json::to_value(Resolution::Override {
            state_code: "excused".into(),
        })
        .unwrap();
        assert_eq!(json["choice"], "override");
        assert_eq!(json["state_code"], "excused");

        let back: Resolution = serde_json::from_str(r#"{"choice":"version_b"}"#).unwrap();
        assert_eq!(back, Resolution::VersionB);
    }
}
