//! In-process data plane
//!
//! Runs transfers on the engine's own runtime through a [`PipelineService`]
//! and reports outcomes on the engine's notification channel.

use super::pipeline::PipelineService;
use super::{
    DataPlaneClient, DataPlaneError, DataPlaneNotification, InitiateRequest, NotificationSender,
};
use async_trait::async_trait;
use conduit_registry::{DataPlaneInstance, TransportType};
use conduit_store::TransferHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A running transfer; removed once it finishes or is terminated
struct LocalTransfer {
    handle: TransferHandle,
    task: Option<JoinHandle<()>>,
}

type TransferTable = Arc<Mutex<HashMap<String, LocalTransfer>>>;

pub struct LocalDataPlane {
    id: String,
    transport_types: Vec<TransportType>,
    pipeline: Arc<PipelineService>,
    notifications: NotificationSender,
    transfers: TransferTable,
}

impl LocalDataPlane {
    pub fn new<I, T>(
        id: impl Into<String>,
        transport_types: I,
        pipeline: Arc<PipelineService>,
        notifications: NotificationSender,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TransportType>,
    {
        Self {
            id: id.into(),
            transport_types: transport_types.into_iter().map(Into::into).collect(),
            pipeline,
            notifications,
            transfers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of transfers still running
    pub fn active_transfers(&self) -> usize {
        self.transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_transfer(&self, request: InitiateRequest, handle: TransferHandle) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let notifications = self.notifications.clone();
        let transfers = self.transfers.clone();
        let instance_id = self.id.clone();

        tokio::spawn(async move {
            let process_id = request.process_id.clone();
            let notification = match pipeline.transfer(&request.source, &request.destination).await {
                Ok(bytes) => {
                    info!(process_id = %process_id, instance_id = %instance_id, bytes, "Local transfer finished");
                    DataPlaneNotification::completed(&process_id, handle)
                }
                Err(e) => {
                    warn!(process_id = %process_id, instance_id = %instance_id, error = %e, "Local transfer failed");
                    DataPlaneNotification::failed(&process_id, handle, e.code(), Some(e.to_string()))
                }
            };

            transfers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&process_id);

            if notifications.send(notification).await.is_err() {
                warn!(process_id = %process_id, "Notification channel closed; outcome dropped");
            }
        })
    }
}

#[async_trait]
impl DataPlaneClient for LocalDataPlane {
    fn instance_id(&self) -> &str {
        &self.id
    }

    async fn initiate(&self, request: InitiateRequest) -> Result<TransferHandle, DataPlaneError> {
        if !self.transport_types.contains(&request.transport_type) {
            return Err(DataPlaneError::rejected(
                &self.id,
                format!("transport type {} not served", request.transport_type),
            ));
        }
        self.pipeline
            .validate(&request.source, &request.destination)
            .map_err(|e| DataPlaneError::rejected(&self.id, e.to_string()))?;

        let mut transfers = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = transfers.get(&request.process_id) {
            debug!(process_id = %request.process_id, handle = %existing.handle, "Initiate repeated; returning existing handle");
            return Ok(existing.handle.clone());
        }

        let handle = TransferHandle::new(format!("{}:{}", self.id, Uuid::new_v4()));
        let process_id = request.process_id.clone();
        transfers.insert(
            process_id.clone(),
            LocalTransfer {
                handle: handle.clone(),
                task: None,
            },
        );
        drop(transfers);

        let task = self.spawn_transfer(request, handle.clone());
        if let Some(entry) = self
            .transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&process_id)
        {
            entry.task = Some(task);
        }

        info!(process_id = %process_id, handle = %handle, "Local transfer accepted");
        Ok(handle)
    }

    async fn terminate(&self, handle: &TransferHandle) -> Result<(), DataPlaneError> {
        let mut transfers = self.transfers.lock().unwrap_or_else(PoisonError::into_inner);
        let process_id = transfers
            .iter()
            .find(|(_, t)| &t.handle == handle)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| DataPlaneError::UnknownHandle(handle.to_string()))?;

        if let Some(task) = transfers.remove(&process_id).and_then(|t| t.task) {
            task.abort();
        }
        info!(process_id = %process_id, handle = %handle, "Local transfer aborted");
        Ok(())
    }

    fn advertise(&self) -> Option<DataPlaneInstance> {
        let load = u32::try_from(self.active_transfers()).unwrap_or(u32::MAX);
        Some(DataPlaneInstance::new(&self.id, self.transport_types.iter().cloned()).with_load(load))
    }
}
