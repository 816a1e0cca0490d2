//! Engine configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PresenceError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Two writes from different devices whose timestamps are at most this
    /// far apart are treated as concurrent. Whole seconds.
    pub reconciliation_window_secs: i64,
    /// Lifetime of cached default state sets, in whole seconds
    pub state_cache_ttl_secs: u64,
    /// Whether a resolver may pick a state neither device submitted
    pub allow_override_resolution: bool,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconciliation_window_secs: 300,
            state_cache_ttl_secs: 3600,
            allow_override_resolution: true,
            event_buffer: 64,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: EngineConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconciliation_window_secs < 0 {
            return Err(PresenceError::MalformedPayload(format!(
                "reconciliation_window_secs must not be negative (got {})",
                self.reconciliation_window_secs
            )));
        }
        if self.event_buffer == 0 {
            return Err(PresenceError::MalformedPayload(
                "event_buffer must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Set the window. Windows are kept in whole seconds; a fractional
    /// window is rounded up so it never shrinks to zero.
    pub fn with_reconciliation_window(mut self, window: chrono::Duration) -> Self {
        let secs = window.num_seconds();
        self.reconciliation_window_secs = if window > chrono::Duration::seconds(secs) {
            secs + 1
        } else {
            secs
        };
        self
    }

    /// Set the cache lifetime, rounded up to whole seconds.
    pub fn with_state_cache_ttl(mut self, ttl: Duration) -> Self {
        self.state_cache_ttl_secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        self
    }

    pub fn with_override_resolution(mut self, allowed: bool) -> Self {
        self.allow_override_resolution = allowed;
        self
    }

    pub fn reconciliation_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconciliation_window_secs.max(0))
    }

    pub fn state_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.state_cache_ttl_secs)
    }
}
