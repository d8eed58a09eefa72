//! Data-plane execution seam
//!
//! The transfer state machine never moves bytes itself. It hands an
//! [`InitiateRequest`] to the [`DataPlaneClient`] registered for the selected
//! instance, and later receives a [`DataPlaneNotification`] on the engine's
//! notification channel once the data plane finishes.
//!
//! Clients are registered explicitly at startup through
//! [`DataPlaneClients`]; there is no runtime discovery.

pub mod local;
pub mod pipeline;
pub mod status;

pub use local::LocalDataPlane;
pub use pipeline::{DataSink, DataSource, Part, PipelineError, PipelineService};
pub use status::{FileStatusChecker, StatusChecker, StatusCheckers};

use async_trait::async_trait;
use conduit_registry::{DataPlaneInstance, TransportType};
use conduit_store::{EndpointDescriptor, TransferHandle, TransferProcess};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Sending half of the engine's notification channel
pub type NotificationSender = mpsc::Sender<DataPlaneNotification>;

/// Everything a data plane needs to start moving one transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitiateRequest {
    /// Idempotency key: a data plane must return the same handle when asked
    /// twice for the same process
    pub process_id: String,
    pub contract_id: String,
    pub source: EndpointDescriptor,
    pub destination: EndpointDescriptor,
    pub transport_type: TransportType,
}

impl InitiateRequest {
    pub fn for_process(process: &TransferProcess) -> Self {
        Self {
            process_id: process.id.clone(),
            contract_id: process.contract_id.clone(),
            source: process.source.clone(),
            destination: process.destination.clone(),
            transport_type: process.transport_type.clone(),
        }
    }
}

/// Asynchronous outcome reported by a data plane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationKind {
    Completed,
    Failed {
        code: String,
        detail: Option<String>,
    },
}

/// `completed(handle)` / `failed(handle, reason)` signal for one process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataPlaneNotification {
    pub process_id: String,
    pub handle: TransferHandle,
    pub kind: NotificationKind,
}

impl DataPlaneNotification {
    pub fn completed(process_id: impl Into<String>, handle: TransferHandle) -> Self {
        Self {
            process_id: process_id.into(),
            handle,
            kind: NotificationKind::Completed,
        }
    }

    pub fn failed(
        process_id: impl Into<String>,
        handle: TransferHandle,
        code: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            handle,
            kind: NotificationKind::Failed {
                code: code.into(),
                detail,
            },
        }
    }
}

/// Errors returned by data-plane clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataPlaneError {
    /// The instance refused to start the transfer
    #[error("Data plane {instance_id} rejected transfer: {message}")]
    Rejected {
        instance_id: String,
        message: String,
    },

    /// The instance could not be reached or has no registered client
    #[error("Data plane {instance_id} unavailable: {message}")]
    Unavailable {
        instance_id: String,
        message: String,
    },

    #[error("Unknown transfer handle: {0}")]
    UnknownHandle(String),
}

impl DataPlaneError {
    pub fn rejected(instance_id: impl Into<String>, message: impl Into<String>) -> Self {
        DataPlaneError::Rejected {
            instance_id: instance_id.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(instance_id: impl Into<String>, message: impl Into<String>) -> Self {
        DataPlaneError::Unavailable {
            instance_id: instance_id.into(),
            message: message.into(),
        }
    }
}

/// Client for one data-plane instance
///
/// `initiate` returns as soon as the data plane has accepted the transfer;
/// completion is reported later as a [`DataPlaneNotification`].
#[async_trait]
pub trait DataPlaneClient: Send + Sync {
    /// Instance id this client talks to
    fn instance_id(&self) -> &str;

    /// Ask the data plane to start a transfer
    ///
    /// Must be idempotent per `request.process_id`.
    async fn initiate(&self, request: InitiateRequest) -> Result<TransferHandle, DataPlaneError>;

    /// Stop a running transfer
    ///
    /// Best effort; the state machine logs failures and carries on.
    async fn terminate(&self, handle: &TransferHandle) -> Result<(), DataPlaneError> {
        let _ = handle;
        Ok(())
    }

    /// Current registration for in-process data planes
    ///
    /// Remote planes register through their own channel and return `None`.
    fn advertise(&self) -> Option<DataPlaneInstance> {
        None
    }
}

/// Clients keyed by instance id
#[derive(Default)]
pub struct DataPlaneClients {
    clients: RwLock<HashMap<String, Arc<dyn DataPlaneClient>>>,
}

impl DataPlaneClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the client for `client.instance_id()`
    pub fn register(&self, client: Arc<dyn DataPlaneClient>) {
        let id = client.instance_id().to_string();
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        if clients.insert(id.clone(), client).is_some() {
            info!(instance_id = %id, "Replaced data-plane client");
        } else {
            info!(instance_id = %id, "Registered data-plane client");
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<dyn DataPlaneClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn DataPlaneClient>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
