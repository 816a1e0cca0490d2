//! Directory boundary
//!
//! Sessions and participants are owned elsewhere. The engine only needs to
//! know which organization (and domain) an id belongs to.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Domain, OrganizationId, ParticipantId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionScope {
    pub organization: OrganizationId,
    /// Domain type of the owning organization
    pub domain: Domain,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantScope {
    pub organization: OrganizationId,
}

/// Lookup of session and participant scope
pub trait Directory: Send + Sync {
    fn session(&self, id: SessionId) -> Option<SessionScope>;

    fn participant(&self, id: ParticipantId) -> Option<ParticipantScope>;
}

/// Directory held in memory, loadable from JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InMemoryDirectory {
    #[serde(default)]
    sessions: HashMap<SessionId, SessionScope>,
    #[serde(default)]
    participants: HashMap<ParticipantId, ParticipantScope>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn add_session(
        &mut self,
        id: SessionId,
        organization: OrganizationId,
        domain: impl Into<Domain>,
    ) -> &mut Self {
        self.sessions.insert(
            id,
            SessionScope {
                organization,
                domain: domain.into(),
            },
        );
        self
    }

    pub fn add_participant(&mut self, id: ParticipantId, organization: OrganizationId) -> &mut Self {
        self.participants
            .insert(id, ParticipantScope { organization });
        self
    }
}

impl Directory for InMemoryDirectory {
    fn session(&self, id: SessionId) -> Option<SessionScope> {
        self.sessions.get(&id).cloned()
    }

    fn participant(&self, id: ParticipantId) -> Option<ParticipantScope> {
        self.participants.get(&id).cloned()
    }
}
