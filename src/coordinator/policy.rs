//! Reconciliation window policy
//!
//! Decides what an incoming write does to the authoritative record, given
//! only the record and the write. No storage access happens here.

use chrono::{DateTime, Duration, Utc};

use crate::model::{DeviceId, PresenceRecord, StateId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteDecision {
    /// No record yet for the pairing
    Create,
    /// Same state the record already holds
    Unchanged,
    /// The write supersedes the record
    Apply,
    /// The record supersedes the write
    Stale,
    /// Different devices, timestamps too close to order
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconciliationWindow(Duration);

impl ReconciliationWindow {
    pub fn new(width: Duration) -> Self {
        Self(width.max(Duration::zero()))
    }

    pub fn width(&self) -> Duration {
        self.0
    }

    pub fn contains(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        let gap = if a >= b { a - b } else { b - a };
        gap <= self.0
    }

    pub fn classify(
        &self,
        existing: Option<&PresenceRecord>,
        state: StateId,
        device: Option<&DeviceId>,
        submitted_at: DateTime<Utc>,
    ) -> WriteDecision {
        let record = match existing {
            Some(record) => record,
            None => return WriteDecision::Create,
        };
        if record.state == state {
            return WriteDecision::Unchanged;
        }

        // A device correcting its own earlier write is ordered by timestamp alone.
        if record.source_device.as_ref() == device {
            return if submitted_at >= record.recorded_at {
                WriteDecision::Apply
            } else {
                WriteDecision::Stale
            };
        }

        if self.contains(submitted_at, record.recorded_at) {
            WriteDecision::Conflict
        } else if submitted_at > record.recorded_at {
            WriteDecision::Apply
        } else {
            WriteDecision::Stale
        }
    }
}
