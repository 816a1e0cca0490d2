// Rollcall - Presence Synchronization & Audit Engine

pub mod audit;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod events;
pub mod model;
pub mod registry;
pub mod store;

pub use config::EngineConfig;
pub use coordinator::{Outcome, PresenceWriteCoordinator, Submission, SyncRequest, SyncResponse};
pub use error::{ErrorKind, PresenceError, Result};
