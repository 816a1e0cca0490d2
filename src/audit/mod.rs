//! Append-only, hash-chained audit trail
//!
//! Every mutation of a tracked entity is documented by an [`AuditLog`] entry
//! written in the same transaction as the mutation itself.

pub mod chain;
mod entry;
mod trail;

pub use chain::ChainVerifier;
pub use entry::{
    AuditAction, AuditDraft, AuditLog, PRESENCE_RECORDS, PRESENCE_STATES, SYNC_CONFLICTS,
};
pub use trail::{AuditCursor, AuditFilter, AuditTrail};
