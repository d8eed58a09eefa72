//! Error types for the conduit-registry crate

use crate::TransportType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No eligible data plane for transport type {transport_type}")]
    NoEligibleDataPlane { transport_type: TransportType },

    #[error("Data plane not found: {0}")]
    InstanceNotFound(String),
}
