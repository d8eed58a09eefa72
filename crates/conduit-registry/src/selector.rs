//! Selector: deterministic choice of a data plane for one transfer

use crate::error::RegistryError;
use crate::registry::DataPlaneRegistry;
use crate::{DataPlaneInstance, TransportType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a selection, embedded into the transfer process record
///
/// Holds the instance id only; the registry keeps ownership of the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionResult {
    pub instance_id: String,
    pub transport_type: TransportType,
}

impl SelectionResult {
    pub fn new(instance: &DataPlaneInstance, transport_type: &TransportType) -> Self {
        Self {
            instance_id: instance.id.clone(),
            transport_type: transport_type.clone(),
        }
    }
}

/// Picks one eligible data plane for a transport type
///
/// Lowest load wins; equal loads fall back to the lexicographically smallest
/// instance id. Every call reads the registry afresh.
#[derive(Debug, Clone)]
pub struct Selector {
    registry: Arc<DataPlaneRegistry>,
}

impl Selector {
    pub fn new(registry: Arc<DataPlaneRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DataPlaneRegistry> {
        &self.registry
    }

    /// Select an instance for `transport_type`, skipping ids in `exclude`
    ///
    /// # Errors
    ///
    /// `RegistryError::NoEligibleDataPlane` when nothing remains after
    /// filtering.
    pub fn select(
        &self,
        transport_type: &TransportType,
        exclude: &[String],
    ) -> Result<DataPlaneInstance, RegistryError> {
        let chosen = self
            .registry
            .list(transport_type)
            .into_iter()
            .filter(|instance| !exclude.iter().any(|id| id == &instance.id))
            .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)))
            .ok_or_else(|| RegistryError::NoEligibleDataPlane {
                transport_type: transport_type.clone(),
            })?;

        debug!(
            instance_id = %chosen.id,
            transport = %transport_type,
            load = chosen.load,
            excluded = exclude.len(),
            "Selected data plane"
        );

        Ok(chosen)
    }

    /// Same as [`Selector::select`], reduced to the persisted reference
    pub fn selection(
        &self,
        transport_type: &TransportType,
        exclude: &[String],
    ) -> Result<SelectionResult, RegistryError> {
        self.select(transport_type, exclude)
            .map(|instance| SelectionResult::new(&instance, transport_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector_with(instances: Vec<DataPlaneInstance>) -> Selector {
        let registry = Arc::new(DataPlaneRegistry::default());
        for instance in instances {
            registry.register(instance);
        }
        Selector::new(registry)
    }

    #[test]
    fn test_lowest_load_wins() {
        let selector = selector_with(vec![
            DataPlaneInstance::new("dp-a", ["HTTP-PULL"]).with_load(3),
            DataPlaneInstance::new("dp-b", ["HTTP-PULL"]).with_load(1),
        ]);

        let chosen = selector.select(&TransportType::new("HTTP-PULL"), &[]).unwrap();
        assert_eq!(chosen.id, "dp-b");
    }

    #[test]
    fn test_equal_load_smallest_id_wins() {
        let selector = selector_with(vec![
            DataPlaneInstance::new("dp-z", ["HTTP-PULL"]).with_load(2),
            DataPlaneInstance::new("dp-m", ["HTTP-PULL"]).with_load(2),
        ]);

        let chosen = selector.select(&TransportType::new("HTTP-PULL"), &[]).unwrap();
        assert_eq!(chosen.id, "dp-m");
    }

    #[test]
    fn test_exclusion_is_honored() {
        let selector = selector_with(vec![
            DataPlaneInstance::new("dp-a", ["FILE"]).with_load(0),
            DataPlaneInstance::new("dp-b", ["FILE"]).with_load(7),
        ]);

        let chosen = selector
            .select(&TransportType::new("FILE"), &["dp-a".to_string()])
            .unwrap();
        assert_eq!(chosen.id, "dp-b");
    }

    #[test]
    fn test_everything_excluded_is_no_eligible() {
        let selector = selector_with(vec![DataPlaneInstance::new("dp-a", ["FILE"])]);

        let result = selector.select(&TransportType::new("FILE"), &["dp-a".to_string()]);
        assert_eq!(
            result,
            Err(RegistryError::NoEligibleDataPlane {
                transport_type: TransportType::new("FILE")
            })
        );
    }

    #[test]
    fn test_empty_registry_is_no_eligible() {
        let selector = selector_with(vec![]);
        assert!(matches!(
            selector.select(&TransportType::new("HTTP-PULL"), &[]),
            Err(RegistryError::NoEligibleDataPlane { .. })
        ));
    }

    #[test]
    fn test_selection_result_carries_transport() {
        let selector = selector_with(vec![DataPlaneInstance::new("dp-a", ["FILE"])]);
        let result = selector.selection(&TransportType::new("file"), &[]).unwrap();
        assert_eq!(result.instance_id, "dp-a");
        assert_eq!(result.transport_type.as_str(), "FILE");
    }
}
