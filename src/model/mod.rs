//! Shared data model
//!
//! Identifiers are plain numeric aliases, matching the storage layout: every
//! table keys its rows by a numeric id and the audit trail refers back to rows
//! by `(table_name, record_id)` only.

mod domain;
mod presence;

pub use domain::Domain;
pub use presence::{PresenceRecord, PresenceState};

use serde::{Deserialize, Serialize};
use std::fmt;

pub type OrganizationId = i64;
pub type SessionId = i64;
pub type ParticipantId = i64;
pub type ActorId = i64;
pub type StateId = i64;
pub type RecordId = i64;
pub type ConflictId = i64;
pub type AuditId = u64;

/// Identifier of a frontline sync client
pub type DeviceId = String;

/// A (session, participant) combination: the unit of presence ownership.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pairing {
    pub session: SessionId,
    pub participant: ParticipantId,
}

impl Pairing {
    pub fn new(session: SessionId, participant: ParticipantId) -> Self {
        Self {
            session,
            participant,
        }
    }
}

impl fmt::Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} / participant {}", self.session, self.participant)
    }
}
