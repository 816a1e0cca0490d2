//! Change notifications for external subscribers
//!
//! Events are published after the transaction that produced them has
//! committed. Nobody listening, or a sink failing, is logged and otherwise
//! ignored.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::OrganizationId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RecordCreated,
    RecordUpdated,
    ConflictDetected,
    ConflictResolved,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub organization: OrganizationId,
    pub kind: EventKind,
    /// Table of the entity the event is about
    pub entity: String,
    pub entity_id: i64,
    pub summary: String,
}

impl PresenceEvent {
    pub fn new(
        organization: OrganizationId,
        kind: EventKind,
        entity: &str,
        entity_id: i64,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            organization,
            kind,
            entity: entity.to_string(),
            entity_id,
            summary: summary.into(),
        }
    }
}

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous receiver of events, e.g. a notification queue writer
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &PresenceEvent) -> Result<(), SinkError>;
}

pub struct EventHub {
    tx: broadcast::Sender<PresenceEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.tx.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn publish(&self, events: Vec<PresenceEvent>) {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        for event in events {
            for sink in &sinks {
                if let Err(e) = sink.deliver(&event) {
                    log::warn!(
                        "Event sink failed for {:?} on {} {}: {}",
                        event.kind,
                        event.entity,
                        event.entity_id,
                        e
                    );
                }
            }
            if self.tx.send(event).is_err() {
                log::debug!("No event subscribers");
            }
        }
    }
}
