//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use conduit::dataplane::DataPlaneClients;
use conduit::{
    DataPlaneClient, DataPlaneError, DataPlaneInstance, DataPlaneRegistry, EndpointDescriptor,
    EngineConfig, EventDispatcher, InitiateRequest, RetryPolicy, Selector, TransferHandle,
    TransferManager, TransferRequest, TransferStore,
};
use conduit_store::MemoryStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Scripted answer to one `initiate` call
#[derive(Debug, Clone)]
pub enum Step {
    Accept,
    Reject(&'static str),
    /// Never answers
    Hang,
}

/// Data-plane double: scripted acknowledgments, counted calls
pub struct ScriptedDataPlane {
    id: String,
    transports: Vec<String>,
    load: u32,
    script: Mutex<VecDeque<Step>>,
    initiates: AtomicUsize,
    terminated: Mutex<Vec<TransferHandle>>,
    gate: Option<Gate>,
}

/// Holds `initiate` until released, so tests can act mid-call
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedDataPlane {
    /// Plane that accepts every call
    pub fn accepting(id: &str, transports: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            transports: transports.iter().map(|t| t.to_string()).collect(),
            load: 0,
            script: Mutex::new(VecDeque::new()),
            initiates: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// Plane that rejects every call
    pub fn rejecting(id: &str, transports: &[&str]) -> Self {
        Self::accepting(id, transports).with_script(vec![Step::Reject("capacity exceeded"); 16])
    }

    /// Plane that never answers `initiate`
    pub fn hanging(id: &str, transports: &[&str]) -> Self {
        Self::accepting(id, transports).with_script(vec![Step::Hang; 16])
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.load = load;
        self
    }

    /// Answers for the next calls; afterwards every call is accepted
    pub fn with_script(self, steps: Vec<Step>) -> Self {
        *self.script.lock().unwrap() = steps.into();
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn instance(&self) -> DataPlaneInstance {
        DataPlaneInstance::new(&self.id, self.transports.iter().map(String::as_str)).with_load(self.load)
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiates.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> Vec<TransferHandle> {
        self.terminated.lock().unwrap().clone()
    }

    pub fn handle_for(&self, process_id: &str) -> TransferHandle {
        TransferHandle::new(format!("{}/{}", self.id, process_id))
    }
}

#[async_trait]
impl DataPlaneClient for ScriptedDataPlane {
    fn instance_id(&self) -> &str {
        &self.id
    }

    async fn initiate(&self, request: InitiateRequest) -> Result<TransferHandle, DataPlaneError> {
        self.initiates.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);
        match step {
            Step::Accept => Ok(self.handle_for(&request.process_id)),
            Step::Reject(message) => Err(DataPlaneError::rejected(&self.id, message)),
            Step::Hang => std::future::pending().await,
        }
    }

    async fn terminate(&self, handle: &TransferHandle) -> Result<(), DataPlaneError> {
        self.terminated.lock().unwrap().push(handle.clone());
        Ok(())
    }
}

pub struct Harness {
    pub manager: Arc<TransferManager>,
    pub registry: Arc<DataPlaneRegistry>,
    pub store: Arc<dyn TransferStore>,
    pub dispatcher: Arc<EventDispatcher>,
}

pub fn harness(planes: &[Arc<ScriptedDataPlane>]) -> Harness {
    harness_with(Arc::new(MemoryStore::new()), planes, EngineConfig::default())
}

pub fn harness_with(
    store: Arc<dyn TransferStore>,
    planes: &[Arc<ScriptedDataPlane>],
    config: EngineConfig,
) -> Harness {
    let registry = Arc::new(DataPlaneRegistry::default());
    let clients = Arc::new(DataPlaneClients::new());
    for plane in planes {
        registry.register(plane.instance());
        clients.register(plane.clone());
    }
    let dispatcher = Arc::new(EventDispatcher::new());

    let manager = TransferManager::new(
        store.clone(),
        Selector::new(registry.clone()),
        clients,
        dispatcher.clone(),
        &config,
    )
    .with_retry_policy(RetryPolicy::immediate());

    Harness {
        manager: Arc::new(manager),
        registry,
        store,
        dispatcher,
    }
}

pub fn request(id: &str, transport: &str) -> TransferRequest {
    TransferRequest::new(
        "contract-1",
        EndpointDescriptor::new("/data/in", transport),
        EndpointDescriptor::new("/data/out", transport),
        transport,
    )
    .with_id(id)
}
