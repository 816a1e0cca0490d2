use thiserror::Error;

use crate::model::{AuditId, ConflictId, ParticipantId, SessionId, StateId};

/// Broad category of a failure, used by callers to decide what to show or retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: reported to the caller, nothing was written.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// An attempt to alter an audit entry or a resolved conflict.
    ImmutableRecordViolation,
    /// The storage backend failed; no partial state was committed.
    StorageUnavailable,
}

#[derive(Error, Debug)]
pub enum PresenceError {
    #[error("Unknown presence state: {0}")]
    UnknownState(String),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Participant {participant} is not in the organization of session {session}")]
    ScopeMismatch {
        session: SessionId,
        participant: ParticipantId,
    },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Presence state {0} is referenced by presence records")]
    StateInUse(StateId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),

    #[error("Invalid resolution choice: {0}")]
    InvalidChoice(String),

    #[error("Immutable record: {0}")]
    ImmutableRecord(String),

    #[error("Audit chain broken at entry {0}")]
    TamperDetected(AuditId),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Another commit touching the same row has not reached the journal yet.
    #[error("Write in progress for {0}")]
    WriteInProgress(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PresenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PresenceError::UnknownState(_)
            | PresenceError::UnknownSession(_)
            | PresenceError::UnknownParticipant(_)
            | PresenceError::ScopeMismatch { .. }
            | PresenceError::MalformedPayload(_)
            | PresenceError::AlreadyExists(_)
            | PresenceError::StateInUse(_)
            | PresenceError::InvalidChoice(_) => ErrorKind::Validation,
            PresenceError::NotFound(_) => ErrorKind::NotFound,
            PresenceError::AlreadyResolved(_)
            | PresenceError::ImmutableRecord(_)
            | PresenceError::TamperDetected(_) => ErrorKind::ImmutableRecordViolation,
            PresenceError::StorageUnavailable(_)
            | PresenceError::WriteInProgress(_)
            | PresenceError::Serialization(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Short stable code for user-facing reporting.
    pub fn code(&self) -> &'static str {
        match self {
            PresenceError::UnknownState(_) => "unknown_state",
            PresenceError::UnknownSession(_) => "unknown_session",
            PresenceError::UnknownParticipant(_) => "unknown_participant",
            PresenceError::ScopeMismatch { .. } => "scope_mismatch",
            PresenceError::MalformedPayload(_) => "malformed_payload",
            PresenceError::AlreadyExists(_) => "already_exists",
            PresenceError::StateInUse(_) => "state_in_use",
            PresenceError::NotFound(_) => "not_found",
            PresenceError::AlreadyResolved(_) => "already_resolved",
            PresenceError::InvalidChoice(_) => "invalid_choice",
            PresenceError::ImmutableRecord(_) => "immutable_record",
            PresenceError::TamperDetected(_) => "tamper_detected",
            PresenceError::StorageUnavailable(_) => "storage_unavailable",
            PresenceError::WriteInProgress(_) => "write_in_progress",
            PresenceError::Serialization(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for PresenceError {
    fn from(e: std::io::Error) -> Self {
        PresenceError::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for PresenceError {
    fn from(e: serde_json::Error) -> Self {
        PresenceError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PresenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert_eq!(
            PresenceError::UnknownState("late".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            PresenceError::AlreadyResolved(3).kind(),
            ErrorKind::ImmutableRecordViolation
        );
        assert_eq!(
            PresenceError::ImmutableRecord("audit 1".into()).kind(),
            ErrorKind::ImmutableRecordViolation
        );
        assert_eq!(
            PresenceError::StorageUnavailable("disk".into()).kind(),
            ErrorKind::StorageUnavailable
        );
        let busy = PresenceError::WriteInProgress("presence_records 4".into());
        assert_eq!(busy.kind(), ErrorKind::StorageUnavailable);
        assert_eq!(busy.code(), "write_in_progress");
    }

    #[test]
    fn test_io_error_is_storage_unavailable() {
        let err: PresenceError = std::io::Error::new(std::io::ErrorKind::Other, "gone").into();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(err.to_string().contains("gone"));
    }
}
