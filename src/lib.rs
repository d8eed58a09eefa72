/*!
 * Conduit - dataspace transfer engine
 *
 * Control-plane core of a dataspace connector:
 * - Data-plane registry with heartbeat-derived health
 * - Deterministic data-plane selection by transport type and load
 * - Transfer state machine with provisioning retries across instances
 * - Durable process store with restart recovery
 * - Ordered, failure-isolated transition events
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod config;
pub mod dataplane;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod transfer;

// Re-export commonly used types
pub use config::{ConduitConfig, EngineConfig};
pub use dataplane::{DataPlaneClient, DataPlaneError, DataPlaneNotification, InitiateRequest};
pub use engine::{Engine, EngineHandle};
pub use error::{ConduitError, Result, TransferError};
pub use events::{EventDispatcher, TransferEvent, TransferListener};
pub use transfer::{RecoveryReport, RetryPolicy, TransferManager, TransferRequest};

pub use conduit_registry::{
    DataPlaneInstance, DataPlaneRegistry, HealthStatus, SelectionResult, Selector, TransportType,
};
pub use conduit_store::{
    EndpointDescriptor, TerminalReason, TransferHandle, TransferProcess, TransferState,
    TransferStats, TransferStore,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
