//! DataPlaneRegistry: the set of known data planes and their health

use crate::error::RegistryError;
use crate::{DataPlaneInstance, HealthStatus, TransportType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Thresholds used to derive instance health
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Instances without a heartbeat for this long are marked unreachable
    pub heartbeat_timeout: Duration,

    /// Self-reported load at or above which an instance is degraded
    pub degraded_load: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            degraded_load: 80,
        }
    }
}

/// Registry of data-plane instances
///
/// Reads (`list`, `get`) take a shared lock and never block each other;
/// `register`, `remove` and `evict_stale` take the exclusive lock. The
/// registry is the only place health is assigned.
///
/// # Example
///
/// ```
/// use conduit_registry::{DataPlaneInstance, DataPlaneRegistry, TransportType};
///
/// let registry = DataPlaneRegistry::default();
/// registry.register(DataPlaneInstance::new("dp-1", ["FILE"]));
///
/// let eligible = registry.list(&TransportType::new("FILE"));
/// assert_eq!(eligible.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct DataPlaneRegistry {
    instances: RwLock<HashMap<String, DataPlaneInstance>>,
    config: RegistryConfig,
}

impl DataPlaneRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert or update an instance and refresh its heartbeat
    pub fn register(&self, instance: DataPlaneInstance) {
        self.register_at(instance, Utc::now());
    }

    /// Insert or update an instance with an explicit heartbeat time
    ///
    /// Re-registering the same instance is idempotent apart from the
    /// refreshed heartbeat.
    pub fn register_at(&self, mut instance: DataPlaneInstance, now: DateTime<Utc>) {
        instance.last_heartbeat = now;
        instance.health = self.health_for_load(instance.load);

        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        match instances.insert(instance.id.clone(), instance.clone()) {
            None => info!(
                instance_id = %instance.id,
                transports = ?instance.transport_types,
                "Registered data plane"
            ),
            Some(previous) if previous.health != instance.health => info!(
                instance_id = %instance.id,
                from = %previous.health,
                to = %instance.health,
                load = instance.load,
                "Data plane health changed"
            ),
            Some(_) => debug!(instance_id = %instance.id, load = instance.load, "Heartbeat"),
        }
    }

    /// All eligible instances advertising `transport_type`, by ascending load
    ///
    /// Unreachable instances are never returned. An empty result is not an
    /// error.
    pub fn list(&self, transport_type: &TransportType) -> Vec<DataPlaneInstance> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<DataPlaneInstance> = instances
            .values()
            .filter(|i| i.health.is_eligible() && i.supports(transport_type))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));
        matching
    }

    /// Downgrade instances whose heartbeat is older than `timeout`
    ///
    /// Past the full timeout an instance becomes unreachable; past half of
    /// it a healthy instance is degraded.
    pub fn evict_stale(&self, now: DateTime<Utc>, timeout: Duration) {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        for instance in instances.values_mut() {
            let age = (now - instance.last_heartbeat)
                .to_std()
                .unwrap_or(Duration::ZERO);

            if age > timeout {
                if instance.health != HealthStatus::Unreachable {
                    warn!(
                        instance_id = %instance.id,
                        age_secs = age.as_secs(),
                        "Data plane missed heartbeat, marking unreachable"
                    );
                    instance.health = HealthStatus::Unreachable;
                }
            } else if age > timeout / 2 && instance.health == HealthStatus::Healthy {
                debug!(instance_id = %instance.id, "Heartbeat ageing, marking degraded");
                instance.health = HealthStatus::Degraded;
            }
        }
    }

    /// Remove an instance entirely
    pub fn remove(&self, id: &str) -> Result<DataPlaneInstance, RegistryError> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        let removed = instances
            .remove(id)
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))?;
        info!(instance_id = %id, "Removed data plane");
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<DataPlaneInstance, RegistryError> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        instances
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::InstanceNotFound(id.to_string()))
    }

    /// Snapshot of every registered instance, including unreachable ones
    pub fn all(&self) -> Vec<DataPlaneInstance> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = instances.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn health_for_load(&self, load: u32) -> HealthStatus {
        if load >= self.config.degraded_load {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> TransportType {
        TransportType::new("FILE")
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = DataPlaneRegistry::default();
        registry.register(DataPlaneInstance::new("dp-1", ["FILE"]));
        registry.register(DataPlaneInstance::new("dp-1", ["FILE"]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_updates_load() {
        let registry = DataPlaneRegistry::default();
        registry.register(DataPlaneInstance::new("dp-1", ["FILE"]).with_load(5));
        registry.register(DataPlaneInstance::new("dp-1", ["FILE"]).with_load(9));
        assert_eq!(registry.get("dp-1").unwrap().load, 9);
    }

    #[test]
    fn test_list_orders_by_load_then_id() {
        let registry = DataPlaneRegistry::default();
        registry.register(DataPlaneInstance::new("dp-c", ["FILE"]).with_load(2));
        registry.register(DataPlaneInstance::new("dp-b", ["FILE"]).with_load(1));
        registry.register(DataPlaneInstance::new("dp-a", ["FILE"]).with_load(2));
        registry.register(DataPlaneInstance::new("dp-x", ["HTTP-PULL"]));

        let ids: Vec<_> = registry.list(&file()).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["dp-b", "dp-a", "dp-c"]);
    }

    #[test]
    fn test_high_load_is_degraded_but_listed() {
        let registry = DataPlaneRegistry::new(RegistryConfig {
            degraded_load: 10,
            ..Default::default()
        });
        registry.register(DataPlaneInstance::new("dp-1", ["FILE"]).with_load(10));

        let listed = registry.list(&file());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].health(), HealthStatus::Degraded);
    }

    #[test]
    fn test_evict_stale_marks_unreachable() {
        let registry = DataPlaneRegistry::default();
        let t0 = Utc::now();
        registry.register_at(DataPlaneInstance::new("old", ["FILE"]), t0);
        registry.register_at(
            DataPlaneInstance::new("fresh", ["FILE"]),
            t0 + chrono::Duration::seconds(50),
        );

        registry.evict_stale(t0 + chrono::Duration::seconds(60), Duration::from_secs(30));

        assert_eq!(registry.get("old").unwrap().health(), HealthStatus::Unreachable);
        assert_eq!(registry.get("fresh").unwrap().health(), HealthStatus::Healthy);

        let ids: Vec<_> = registry.list(&file()).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn test_evict_stale_degrades_ageing_heartbeat() {
        let registry = DataPlaneRegistry::default();
        let t0 = Utc::now();
        registry.register_at(DataPlaneInstance::new("dp-1", ["FILE"]), t0);

        registry.evict_stale(t0 + chrono::Duration::seconds(20), Duration::from_secs(30));
        assert_eq!(registry.get("dp-1").unwrap().health(), HealthStatus::Degraded);
    }

    #[test]
    fn test_heartbeat_restores_unreachable_instance() {
        let registry = DataPlaneRegistry::default();
        let t0 = Utc::now();
        registry.register_at(DataPlaneInstance::new("dp-1", ["FILE"]), t0);
        registry.evict_stale(t0 + chrono::Duration::seconds(120), Duration::from_secs(30));
        assert!(registry.list(&file()).is_empty());

        registry.register_at(
            DataPlaneInstance::new("dp-1", ["FILE"]),
            t0 + chrono::Duration::seconds(121),
        );
        assert_eq!(registry.list(&file()).len(), 1);
    }

    #[test]
    fn test_remove_unknown_instance() {
        let registry = DataPlaneRegistry::default();
        assert_eq!(
            registry.remove("missing"),
            Err(RegistryError::InstanceNotFound("missing".to_string()))
        );
    }
}
