//! Conduit Registry: data-plane bookkeeping and selection
//!
//! This crate owns the control plane's view of the data planes it can hand
//! transfers to. It is the leaf of the Conduit workspace and knows nothing
//! about transfer processes or persistence.
//!
//! # Architecture
//!
//! - **DataPlaneRegistry**: the set of known data-plane instances, their
//!   advertised transport types, self-reported load and derived health
//! - **Selector**: deterministic choice of one eligible instance for a
//!   transport type, honoring an exclusion list
//!
//! # Example
//!
//! ```
//! use conduit_registry::{DataPlaneInstance, DataPlaneRegistry, Selector, TransportType};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(DataPlaneRegistry::default());
//! registry.register(DataPlaneInstance::new("dp-a", ["HTTP-PULL"]).with_load(3));
//! registry.register(DataPlaneInstance::new("dp-b", ["HTTP-PULL"]).with_load(1));
//!
//! let selector = Selector::new(registry);
//! let chosen = selector.select(&TransportType::new("http-pull"), &[]).unwrap();
//! assert_eq!(chosen.id, "dp-b");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod error;
pub mod registry;
pub mod selector;

pub use error::RegistryError;
pub use registry::{DataPlaneRegistry, RegistryConfig};
pub use selector::{SelectionResult, Selector};

/// Tag identifying the mechanism used to move data (e.g. `HTTP-PULL`)
///
/// Transport types compare case-insensitively; the stored form is uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TransportType(String);

impl TransportType {
    pub fn new(tag: impl AsRef<str>) -> Self {
        TransportType(tag.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransportType {
    fn from(value: String) -> Self {
        TransportType::new(value)
    }
}

impl From<&str> for TransportType {
    fn from(value: &str) -> Self {
        TransportType::new(value)
    }
}

impl From<TransportType> for String {
    fn from(value: TransportType) -> Self {
        value.0
    }
}

/// Health of a data-plane instance
///
/// Derived by the registry from heartbeat recency and self-reported load.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Fresh heartbeat, load below the degraded threshold
    Healthy,
    /// Still eligible for selection, but heavily loaded or heartbeat ageing
    Degraded,
    /// No heartbeat within the timeout; never selected
    Unreachable,
}

impl HealthStatus {
    /// Whether an instance in this state may receive new transfers
    pub fn is_eligible(&self) -> bool {
        !matches!(self, HealthStatus::Unreachable)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// A data-plane instance as known to the control plane
///
/// `health` and `last_heartbeat` are owned by [`DataPlaneRegistry`]; whatever
/// values a registration carries are replaced on `register`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPlaneInstance {
    /// Unique instance identifier
    pub id: String,

    /// Transport types this instance can execute
    pub transport_types: BTreeSet<TransportType>,

    /// Self-reported load (lower is better)
    pub load: u32,

    last_heartbeat: DateTime<Utc>,

    health: HealthStatus,
}

impl DataPlaneInstance {
    /// Create a registration for an instance with zero load
    pub fn new<I, T>(id: impl Into<String>, transport_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TransportType>,
    {
        Self {
            id: id.into(),
            transport_types: transport_types.into_iter().map(Into::into).collect(),
            load: 0,
            last_heartbeat: Utc::now(),
            health: HealthStatus::Healthy,
        }
    }

    /// Set the self-reported load
    pub fn with_load(mut self, load: u32) -> Self {
        self.load = load;
        self
    }

    pub fn supports(&self, transport_type: &TransportType) -> bool {
        self.transport_types.contains(transport_type)
    }

    pub fn health(&self) -> HealthStatus {
        self.health
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.last_heartbeat
    }
}
