//! Conflict Detector & Store
//!
//! When two devices disagree about the same pairing within the reconciliation
//! window, both versions are kept as a [`SyncConflict`] instead of one
//! silently overwriting the other. A conflict stays open until someone
//! resolves it; resolution is terminal.

mod conflict_store;
mod types;

pub use conflict_store::{ConflictCursor, ConflictStore};
pub use types::{Resolution, ResolvedWith, SyncConflict, VersionPayload};
