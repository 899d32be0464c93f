//! Capability registry
//!
//! Process-wide catalog of services indexed by the capabilities they offer.
//! Reads take a shared lock and clone descriptors out; writes (`register`,
//! `mark_status`) take a brief exclusive lock. No lock is ever held across a
//! remote call since callers only receive owned snapshots.

use std::collections::HashMap;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    capability::{Capability, ServiceDescriptor, ServiceId, ServiceStatus},
    error::{RegistryError, RegistryResult},
};

/// Ordering applied to the services returned by [`CapabilityRegistry::services_for`].
///
/// In every strategy `available` services come before `degraded` ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceStrategy {
    /// Registration order
    #[default]
    DeclarationOrder,
    /// Descending weight, registration order among equal weights
    Weighted,
    /// Rotate the first candidate on every lookup to spread load
    RoundRobin,
}

#[derive(Debug, Default)]
struct RegistryState {
    services: HashMap<ServiceId, ServiceDescriptor>,
    /// Registration order, first registration wins the slot
    order: Vec<ServiceId>,
    by_capability: HashMap<Capability, Vec<ServiceId>>,
}

impl RegistryState {
    fn reindex(&mut self) {
        self.by_capability.clear();
        for id in &self.order {
            if let Some(desc) = self.services.get(id) {
                for cap in &desc.capabilities {
                    let ids = self.by_capability.entry(cap.clone()).or_default();
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
        }
    }
}

/// Registry mapping service identifiers to capabilities and reachability
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    state: RwLock<RegistryState>,
    strategy: PreferenceStrategy,
    /// Round-robin cursors per capability
    cursors: DashMap<Capability, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::with_strategy(PreferenceStrategy::default())
    }

    pub fn with_strategy(strategy: PreferenceStrategy) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            strategy,
            cursors: DashMap::new(),
        }
    }

    pub fn strategy(&self) -> PreferenceStrategy {
        self.strategy
    }

    /// Add or replace a service by identifier.
    ///
    /// Re-registration keeps the service's original position in declaration
    /// order so that live configuration reloads don't reshuffle preferences.
    pub fn register(&self, descriptor: ServiceDescriptor) -> RegistryResult<()> {
        if descriptor.id.as_str().trim().is_empty() {
            return Err(RegistryError::InvalidDescriptor {
                id: descriptor.id,
                reason: "identifier must not be empty".to_string(),
            });
        }

        let mut state = self.state.write();
        let id = descriptor.id.clone();
        let replaced = state.services.insert(id.clone(), descriptor).is_some();
        if !replaced {
            state.order.push(id.clone());
        }
        state.reindex();
        drop(state);

        info!(service_id = %id, replaced = replaced, "Service registered");
        Ok(())
    }

    /// Update the reachability status of a registered service
    pub fn mark_status(&self, id: &ServiceId, status: ServiceStatus) -> RegistryResult<()> {
        let mut state = self.state.write();
        let desc = state
            .services
            .get_mut(id)
            .ok_or_else(|| RegistryError::ServiceNotFound { id: id.clone() })?;

        let previous = desc.status;
        desc.status = status;
        desc.last_checked = Utc::now();
        drop(state);

        if previous != status {
            info!(
                service_id = %id,
                from = %previous,
                to = %status,
                "Service status changed"
            );
        }
        Ok(())
    }

    /// Selectable services offering `capability`, in preference order.
    ///
    /// Returns an empty list when nothing can serve the capability.
    pub fn services_for(&self, capability: &Capability) -> Vec<ServiceDescriptor> {
        let mut candidates: Vec<ServiceDescriptor> = {
            let state = self.state.read();
            state
                .by_capability
                .get(capability)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| state.services.get(id))
                        .filter(|d| d.status.is_selectable())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        if candidates.is_empty() {
            debug!(capability = %capability, "No selectable services for capability");
            return candidates;
        }

        match self.strategy {
            PreferenceStrategy::DeclarationOrder => {}
            PreferenceStrategy::Weighted => {
                candidates.sort_by(|a, b| b.weight.cmp(&a.weight));
            }
            PreferenceStrategy::RoundRobin => {
                let start = {
                    let mut cursor = self.cursors.entry(capability.clone()).or_insert(0);
                    let start = *cursor;
                    *cursor = cursor.wrapping_add(1);
                    start
                };
                let len = candidates.len();
                candidates.rotate_left(start % len);
            }
        }

        // Stable: preserves the strategy order within each status group
        candidates.sort_by_key(|d| match d.status {
            ServiceStatus::Available => 0,
            _ => 1,
        });

        candidates
    }

    /// Introspection: every registered service, optionally filtered by capability.
    ///
    /// Unlike [`services_for`](Self::services_for) this includes services in
    /// any status, in registration order.
    pub fn query(&self, capability: Option<&Capability>) -> Vec<ServiceDescriptor> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.services.get(id))
            .filter(|d| capability.map_or(true, |c| d.offers(c)))
            .cloned()
            .collect()
    }

    /// Get a service descriptor by identifier
    pub fn get(&self, id: &ServiceId) -> Option<ServiceDescriptor> {
        self.state.read().services.get(id).cloned()
    }

    pub fn status_of(&self, id: &ServiceId) -> Option<ServiceStatus> {
        self.state.read().services.get(id).map(|d| d.status)
    }

    /// All known capabilities, sorted
    pub fn capabilities(&self) -> Vec<Capability> {
        let state = self.state.read();
        let mut caps: Vec<Capability> = state.by_capability.keys().cloned().collect();
        caps.sort();
        caps
    }

    pub fn len(&self) -> usize {
        self.state.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, caps: &[&str], status: ServiceStatus) -> ServiceDescriptor {
        ServiceDescriptor::new(id, caps.iter().map(|c| Capability::new(*c)).collect())
            .with_status(status)
    }

    fn ids(services: &[ServiceDescriptor]) -> Vec<&str> {
        services.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CapabilityRegistry::new();
        registry
            .register(service("whisper", &["speech-to-text"], ServiceStatus::Available))
            .unwrap();

        let found = registry.services_for(&Capability::new("speech-to-text"));
        assert_eq!(ids(&found), vec!["whisper"]);
        assert!(registry
            .services_for(&Capability::new("summarize"))
            .is_empty());
    }

    #[test]
    fn test_register_is_idempotent_and_replaces() {
        let registry = CapabilityRegistry::new();
        registry
            .register(service("phi4", &["summarize"], ServiceStatus::Available))
            .unwrap();
        registry
            .register(service("phi4", &["summarize"], ServiceStatus::Available))
            .unwrap();
        assert_eq!(registry.len(), 1);

        // Replacement drops capabilities no longer declared
        registry
            .register(service("phi4", &["soap-generation"], ServiceStatus::Available))
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry
            .services_for(&Capability::new("summarize"))
            .is_empty());
        assert_eq!(
            ids(&registry.services_for(&Capability::new("soap-generation"))),
            vec!["phi4"]
        );
    }

    #[test]
    fn test_register_rejects_empty_id() {
        let registry = CapabilityRegistry::new();
        let result = registry.register(service("  ", &["summarize"], ServiceStatus::Available));
        assert!(matches!(
            result,
            Err(RegistryError::InvalidDescriptor { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_services_for_filters_unselectable() {
        let registry = CapabilityRegistry::new();
        registry
            .register(service("a", &["cap"], ServiceStatus::Unavailable))
            .unwrap();
        registry
            .register(service("b", &["cap"], ServiceStatus::Unknown))
            .unwrap();
        registry
            .register(service("c", &["cap"], ServiceStatus::Degraded))
            .unwrap();

        assert_eq!(ids(&registry.services_for(&Capability::new("cap"))), vec!["c"]);
    }

    #[test]
    fn test_available_before_degraded() {
        let registry = CapabilityRegistry::new();
        registry
            .register(service("a", &["cap"], ServiceStatus::Degraded))
            .unwrap();
        registry
            .register(service("b", &["cap"], ServiceStatus::Available))
            .unwrap();

        assert_eq!(
            ids(&registry.services_for(&Capability::new("cap"))),
            vec!["b", "a"]
        );
    }

    #[test]
    fn test_weighted_strategy() {
        let registry = CapabilityRegistry::with_strategy(PreferenceStrategy::Weighted);
        registry
            .register(service("low", &["cap"], ServiceStatus::Available).with_weight(1))
            .unwrap();
        registry
            .register(service("high", &["cap"], ServiceStatus::Available).with_weight(10))
            .unwrap();
        registry
            .register(service("mid", &["cap"], ServiceStatus::Available).with_weight(5))
            .unwrap();

        assert_eq!(
            ids(&registry.services_for(&Capability::new("cap"))),
            vec!["high", "mid", "low"]
        );
    }

    #[test]
    fn test_round_robin_rotates() {
        let registry = CapabilityRegistry::with_strategy(PreferenceStrategy::RoundRobin);
        registry
            .register(service("a", &["cap"], ServiceStatus::Available))
            .unwrap();
        registry
            .register(service("b", &["cap"], ServiceStatus::Available))
            .unwrap();
        let cap = Capability::new("cap");

        assert_eq!(ids(&registry.services_for(&cap)), vec!["a", "b"]);
        assert_eq!(ids(&registry.services_for(&cap)), vec!["b", "a"]);
        assert_eq!(ids(&registry.services_for(&cap)), vec!["a", "b"]);
    }

    #[test]
    fn test_mark_status() {
        let registry = CapabilityRegistry::new();
        registry
            .register(service("whisper", &["speech-to-text"], ServiceStatus::Available))
            .unwrap();
        let id = ServiceId::new("whisper");
        let before = registry.get(&id).unwrap().last_checked;

        registry.mark_status(&id, ServiceStatus::Unavailable).unwrap();
        let desc = registry.get(&id).unwrap();
        assert_eq!(desc.status, ServiceStatus::Unavailable);
        assert!(desc.last_checked >= before);
        assert!(registry
            .services_for(&Capability::new("speech-to-text"))
            .is_empty());

        let missing = registry.mark_status(&ServiceId::new("nope"), ServiceStatus::Available);
        assert!(matches!(missing, Err(RegistryError::ServiceNotFound { .. })));
    }

    #[test]
    fn test_query_includes_all_statuses() {
        let registry = CapabilityRegistry::new();
        registry
            .register(service("a", &["x"], ServiceStatus::Unavailable))
            .unwrap();
        registry
            .register(service("b", &["x", "y"], ServiceStatus::Available))
            .unwrap();

        assert_eq!(ids(&registry.query(None)), vec!["a", "b"]);
        assert_eq!(ids(&registry.query(Some(&Capability::new("y")))), vec!["b"]);
        assert_eq!(
            registry.capabilities(),
            vec![Capability::new("x"), Capability::new("y")]
        );
    }
}
