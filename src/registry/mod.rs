//! Presence State Registry
//!
//! Per-organization, per-domain catalog of valid presence states. Default
//! states are created on first use with get-or-create semantics keyed on the
//! (organization, domain, code) tuple, and cached for a bounded time.

mod cache;
pub mod defaults;

pub use cache::TtlCache;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::audit::{AuditAction, AuditDraft, PRESENCE_STATES};
use crate::error::{PresenceError, Result};
use crate::model::{ActorId, Domain, OrganizationId, PresenceState, StateId};
use crate::store::{PresenceStore, Transaction};

/// Color given to custom states when none is supplied
pub const DEFAULT_COLOR: &str = "#00ff00";

type CacheKey = (OrganizationId, Domain);

pub struct PresenceStateRegistry {
    store: Arc<PresenceStore>,
    cache: TtlCache<CacheKey, Vec<PresenceState>>,
}

fn snapshot(state: &PresenceState) -> Value {
    json!({
        "domain": state.domain.as_str(),
        "code": state.code,
        "label": state.label,
        "color": state.color,
        "sort_order": state.sort_order,
        "is_default": state.is_default,
    })
}

fn valid_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

impl PresenceStateRegistry {
    pub fn new(store: Arc<PresenceStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(cache_ttl),
        }
    }

    /// The domain's default states, creating any that are missing.
    pub fn default_states(
        &self,
        organization: OrganizationId,
        domain: &Domain,
    ) -> Result<Vec<PresenceState>> {
        let key = (organization, domain.clone());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let (_, (states, created)) = self.store.transact(|tables| {
            let mut tx = Transaction::new();
            let mut states = Vec::new();
            let mut created = 0;
            for default in defaults::for_domain(domain) {
                if let Some(existing) = tables.find_state(organization, domain, default.code) {
                    states.push(existing.clone());
                    continue;
                }
                let state = PresenceState {
                    id: self.store.next_state_id(),
                    organization,
                    domain: domain.clone(),
                    code: default.code.to_string(),
                    label: default.label.to_string(),
                    color: default.color.to_string(),
                    sort_order: default.sort_order,
                    is_default: true,
                    created_at: Utc::now(),
                };
                tx.audit(
                    AuditDraft::new(organization, PRESENCE_STATES, state.id, AuditAction::Create)
                        .new_values(snapshot(&state)),
                );
                tx.put_state(state.clone());
                states.push(state);
                created += 1;
            }
            Ok((tx, (states, created)))
        })?;

        if created > 0 {
            log::info!(
                "Created {} default presence states for organization {} ({})",
                created,
                organization,
                domain
            );
        }
        self.cache.insert(key, states.clone());
        Ok(states)
    }

    /// Every state of the domain (defaults and custom), in display order
    pub fn states(&self, organization: OrganizationId, domain: &Domain) -> Result<Vec<PresenceState>> {
        self.default_states(organization, domain)?;
        Ok(self.store.read(|t| t.states_for(organization, domain)))
    }

    /// Look up a state by code in the cache or the store, without creating
    /// anything.
    pub fn cached_state(
        &self,
        organization: OrganizationId,
        domain: &Domain,
        code: &str,
    ) -> Result<Option<PresenceState>> {
        let code = code.trim();
        if code.is_empty() {
            return Err(PresenceError::MalformedPayload(
                "presence state code is empty".into(),
            ));
        }

        if let Some(cached) = self.cache.get(&(organization, domain.clone())) {
            if let Some(state) = cached.into_iter().find(|s| s.code == code) {
                return Ok(Some(state));
            }
        }
        Ok(self
            .store
            .read(|t| t.find_state(organization, domain, code).cloned()))
    }

    /// Look up a state by code, materializing the domain defaults on a miss.
    pub fn resolve_state(
        &self,
        organization: OrganizationId,
        domain: &Domain,
        code: &str,
    ) -> Result<PresenceState> {
        if let Some(state) = self.cached_state(organization, domain, code)? {
            return Ok(state);
        }
        let code = code.trim();
        self.default_states(organization, domain)?
            .into_iter()
            .find(|s| s.code == code)
            .ok_or_else(|| PresenceError::UnknownState(format!("{} ({})", code, domain)))
    }

    /// Add an organization-specific state to a domain.
    #[allow(clippy::too_many_arguments)]
    pub fn define_state(
        &self,
        organization: OrganizationId,
        domain: &Domain,
        code: &str,
        label: &str,
        color: Option<&str>,
        sort_order: i32,
        actor: Option<ActorId>,
    ) -> Result<PresenceState> {
        let code = code.trim();
        if code.is_empty() {
            return Err(PresenceError::MalformedPayload(
                "presence state code is empty".into(),
            ));
        }
        let color = color.unwrap_or(DEFAULT_COLOR);
        if !valid_color(color) {
            return Err(PresenceError::MalformedPayload(format!(
                "color {:?} is not a #rrggbb value",
                color
            )));
        }

        let (_, state) = self.store.transact(|tables| {
            if tables.find_state(organization, domain, code).is_some() {
                return Err(PresenceError::AlreadyExists(format!(
                    "presence state {} in {}",
                    code, domain
                )));
            }
            let state = PresenceState {
                id: self.store.next_state_id(),
                organization,
                domain: domain.clone(),
                code: code.to_string(),
                label: label.to_string(),
                color: color.to_string(),
                sort_order,
                is_default: false,
                created_at: Utc::now(),
            };
            let mut tx = Transaction::new();
            tx.audit(
                AuditDraft::new(organization, PRESENCE_STATES, state.id, AuditAction::Create)
                    .changed_by(actor)
                    .new_values(snapshot(&state)),
            );
            tx.put_state(state.clone());
            Ok((tx, state))
        })?;

        self.invalidate(organization, domain);
        Ok(state)
    }

    /// Remove a state. Fails with `StateInUse` once any record references it.
    pub fn delete_state(&self, state_id: StateId, actor: Option<ActorId>) -> Result<()> {
        let (_, state) = self.store.transact(|tables| {
            let state = tables
                .state(state_id)
                .cloned()
                .ok_or_else(|| PresenceError::NotFound(format!("presence state {}", state_id)))?;
            if tables.state_in_use(state_id) {
                return Err(PresenceError::StateInUse(state_id));
            }
            let mut tx = Transaction::new();
            tx.delete_state(state_id);
            tx.audit(
                AuditDraft::new(state.organization, PRESENCE_STATES, state_id, AuditAction::Delete)
                    .changed_by(actor)
                    .old_values(snapshot(&state)),
            );
            Ok((tx, state))
        })?;

        self.invalidate(state.organization, &state.domain);
        Ok(())
    }

    /// Drop the cached default set of a domain
    pub fn invalidate(&self, organization: OrganizationId, domain: &Domain) {
        self.cache.invalidate(&(organization, domain.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrail;

    fn registry() -> (Arc<PresenceStore>, PresenceStateRegistry) {
        let store = Arc::new(PresenceStore::in_memory());
        let registry = PresenceStateRegistry::new(store.clone(), Duration::from_secs(3600));
        (store, registry)
    }

    #[test]
    fn test_default_states_are_idempotent() {
        let (store, registry) = registry();
        let first = registry.default_states(1, &Domain::Education).unwrap();
        registry.invalidate(1, &Domain::Education);
        let second = registry.default_states(1, &Domain::Education).unwrap();

        assert_eq!(first, second);
        let codes: Vec<&str> = first.iter().map(|s| s.code.as_str()).collect();
        assert_eq!(codes, vec!["present", "absent", "late", "excused"]);
        assert!(first.iter().all(|s| s.is_default));
        assert_eq!(store.read(|t| t.states_for(1, &Domain::Education).len()), 4);
        // One system-authored audit entry per created state
        let trail = AuditTrail::new(store);
        assert_eq!(trail.len(), 4);
        assert!(trail.get(1).unwrap().changed_by.is_none());
    }

    #[test]
    fn test_defaults_are_scoped_per_organization() {
        let (store, registry) = registry();
        registry.default_states(1, &Domain::Corporate).unwrap();
        registry.default_states(2, &Domain::Corporate).unwrap();
        assert_eq!(store.read(|t| t.states_for(1, &Domain::Corporate).len()), 4);
        assert_eq!(store.read(|t| t.states_for(2, &Domain::Corporate).len()), 4);
    }

    #[test]
    fn test_resolve_state_materializes_lazily() {
        let (_, registry) = registry();
        let late = registry.resolve_state(1, &Domain::Education, "late").unwrap();
        assert_eq!(late.label, "Late");
        assert_eq!(late.color, "#f59e0b");

        let err = registry
            .resolve_state(1, &Domain::Education, "checked_out")
            .unwrap_err();
        assert!(matches!(err, PresenceError::UnknownState(_)));
    }

    #[test]
    fn test_cached_state_never_creates() {
        let (store, registry) = registry();
        assert_eq!(registry.cached_state(1, &Domain::Education, "late").unwrap(), None);
        assert_eq!(store.read(|t| t.states_for(1, &Domain::Education).len()), 0);
        assert!(matches!(
            registry.cached_state(1, &Domain::Education, "  "),
            Err(PresenceError::MalformedPayload(_))
        ));

        let late = registry.resolve_state(1, &Domain::Education, "late").unwrap();
        registry.invalidate(1, &Domain::Education);
        assert_eq!(
            registry.cached_state(1, &Domain::Education, " late ").unwrap(),
            Some(late)
        );
    }

    #[test]
    fn test_resolve_state_without_default_set() {
        let (_, registry) = registry();
        let retail = Domain::Other("retail".into());
        let err = registry.resolve_state(1, &retail, "present").unwrap_err();
        assert!(matches!(err, PresenceError::UnknownState(_)));

        registry
            .define_state(1, &retail, "present", "In Store", None, 0, Some(9))
            .unwrap();
        let state = registry.resolve_state(1, &retail, "present").unwrap();
        assert_eq!(state.label, "In Store");
        assert_eq!(state.color, DEFAULT_COLOR);
        assert!(!state.is_default);
    }

    #[test]
    fn test_define_state_rejects_duplicates_and_bad_color() {
        let (_, registry) = registry();
        registry.default_states(1, &Domain::Education).unwrap();

        assert!(matches!(
            registry.define_state(1, &Domain::Education, "late", "Late", None, 9, None),
            Err(PresenceError::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.define_state(1, &Domain::Education, "sick", "Sick", Some("red"), 9, None),
            Err(PresenceError::MalformedPayload(_))
        ));

        registry
            .define_state(1, &Domain::Education, "sick", "Sick", Some("#aa0000"), 4, None)
            .unwrap();
        let codes: Vec<String> = registry
            .states(1, &Domain::Education)
            .unwrap()
            .into_iter()
            .map(|s| s.code)
            .collect();
        assert_eq!(codes.last().map(String::as_str), Some("sick"));
    }

    #[test]
    fn test_delete_unused_state() {
        let (store, registry) = registry();
        let state = registry
            .define_state(1, &Domain::Events, "vip", "VIP", None, 5, Some(2))
            .unwrap();
        registry.delete_state(state.id, Some(2)).unwrap();

        assert!(store.read(|t| t.state(state.id).is_none()));
        assert!(matches!(
            registry.delete_state(state.id, None),
            Err(PresenceError::NotFound(_))
        ));
        let trail = AuditTrail::new(store);
        let history: Vec<_> = trail.find_for(PRESENCE_STATES, state.id).collect();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, AuditAction::Delete);
    }
}
