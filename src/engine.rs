//! Engine: wiring and the background event loop
//!
//! ```text
//! data planes ──► notifications ──┐
//!                                 ├──► event loop ──► TransferManager ──► store ──► dispatcher
//! monitor interval ───────────────┘        │
//!                                          └──► registry heartbeats, deadlines, status checks
//! ```
//!
//! # Example
//!
//! ```no_run
//! use conduit::{ConduitConfig, Engine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::build(ConduitConfig::default())?;
//!     engine.manager().recover().await?;
//!
//!     let (mut handle, task) = engine.spawn();
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown();
//!     task.await?;
//!     Ok(())
//! }
//! ```

use crate::config::{ConduitConfig, DataPlaneKind};
use crate::dataplane::{
    DataPlaneClient, DataPlaneClients, DataPlaneNotification, FileStatusChecker, LocalDataPlane,
    NotificationSender, PipelineService, StatusChecker, StatusCheckers,
};
use crate::error::{ConduitError, Result, TransferError};
use crate::events::{EventDispatcher, LoggingListener};
use crate::transfer::TransferManager;
use chrono::Utc;
use conduit_registry::{DataPlaneRegistry, Selector};
use conduit_store::TransferStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Engine {
    config: ConduitConfig,
    registry: Arc<DataPlaneRegistry>,
    clients: Arc<DataPlaneClients>,
    checkers: Arc<StatusCheckers>,
    dispatcher: Arc<EventDispatcher>,
    manager: Arc<TransferManager>,
    notifications_tx: NotificationSender,
    notifications_rx: mpsc::Receiver<DataPlaneNotification>,
}

impl Engine {
    /// Build an engine, opening the store named in the configuration
    pub fn build(config: ConduitConfig) -> Result<Self> {
        config.validate()?;
        let store = conduit_store::open(config.store.path.as_deref())?;
        Self::with_store(config, store)
    }

    /// Build an engine around an already opened store
    pub fn with_store(config: ConduitConfig, store: Arc<dyn TransferStore>) -> Result<Self> {
        let registry = Arc::new(DataPlaneRegistry::new(config.registry.to_registry_config()));
        let clients = Arc::new(DataPlaneClients::new());
        let checkers = Arc::new(StatusCheckers::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        dispatcher.register(Arc::new(LoggingListener));

        let (notifications_tx, notifications_rx) =
            mpsc::channel(config.engine.notification_capacity);

        let manager = Arc::new(TransferManager::new(
            store,
            Selector::new(registry.clone()),
            clients.clone(),
            dispatcher.clone(),
            &config.engine,
        ));

        let engine = Self {
            config,
            registry,
            clients,
            checkers,
            dispatcher,
            manager,
            notifications_tx,
            notifications_rx,
        };
        engine.register_configured_planes()?;
        engine.register_checker(Arc::new(FileStatusChecker));
        Ok(engine)
    }

    fn register_configured_planes(&self) -> Result<()> {
        if self.config.data_planes.is_empty() {
            return Ok(());
        }

        let pipeline = Arc::new(PipelineService::with_builtins());
        for plane in &self.config.data_planes {
            if plane.transport_types.is_empty() {
                return Err(ConduitError::Config(format!(
                    "data plane {} advertises no transport types",
                    plane.id
                )));
            }
            let client: Arc<dyn DataPlaneClient> = match plane.kind {
                DataPlaneKind::Local => Arc::new(LocalDataPlane::new(
                    &plane.id,
                    plane.transport_types.iter().map(String::as_str),
                    pipeline.clone(),
                    self.notifications_tx.clone(),
                )),
            };
            self.register_client(client);
        }
        Ok(())
    }

    /// Register a data-plane client, and its advertisement if it has one
    pub fn register_client(&self, client: Arc<dyn DataPlaneClient>) {
        if let Some(instance) = client.advertise() {
            self.registry.register(instance);
        }
        self.clients.register(client);
    }

    pub fn register_checker(&self, checker: Arc<dyn StatusChecker>) {
        self.checkers.register(checker);
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TransferManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<DataPlaneRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Sender for data planes that report outside the engine
    pub fn notifier(&self) -> NotificationSender {
        self.notifications_tx.clone()
    }

    /// One monitor pass: heartbeats, eviction, deadlines, status checks
    pub async fn sweep(&self) {
        Monitor {
            registry: self.registry.clone(),
            clients: self.clients.clone(),
            checkers: self.checkers.clone(),
            manager: self.manager.clone(),
            heartbeat_timeout: self.config.registry.heartbeat_timeout(),
        }
        .sweep()
        .await;
    }

    /// Spawn the event loop
    ///
    /// The loop runs until [`EngineHandle::shutdown`] is called or the handle
    /// is dropped, then drains queued notifications before returning.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = EngineHandle {
            manager: self.manager.clone(),
            dispatcher: self.dispatcher.clone(),
            notifier: self.notifications_tx.clone(),
            shutdown_tx: Some(shutdown_tx),
        };

        let monitor = Monitor {
            registry: self.registry,
            clients: self.clients,
            checkers: self.checkers,
            manager: self.manager.clone(),
            heartbeat_timeout: self.config.registry.heartbeat_timeout(),
        };
        let interval = self.config.engine.monitor_interval();
        let manager = self.manager;
        let notifications = self.notifications_rx;

        let task = tokio::spawn(async move {
            run_event_loop(manager, monitor, notifications, shutdown_rx, interval).await
        });
        (handle, task)
    }
}

/// Control surface of a running engine
pub struct EngineHandle {
    manager: Arc<TransferManager>,
    dispatcher: Arc<EventDispatcher>,
    notifier: NotificationSender,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EngineHandle {
    pub fn manager(&self) -> &Arc<TransferManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn notifier(&self) -> NotificationSender {
        self.notifier.clone()
    }

    /// Signal the event loop to stop
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("Engine shutdown signal sent");
        }
    }
}

struct Monitor {
    registry: Arc<DataPlaneRegistry>,
    clients: Arc<DataPlaneClients>,
    checkers: Arc<StatusCheckers>,
    manager: Arc<TransferManager>,
    heartbeat_timeout: std::time::Duration,
}

impl Monitor {
    async fn sweep(&self) {
        let now = Utc::now();

        for client in self.clients.all() {
            if let Some(instance) = client.advertise() {
                self.registry.register_at(instance, now);
            }
        }
        self.registry.evict_stale(now, self.heartbeat_timeout);

        match self.manager.check_timeouts_at(now).await {
            Ok(expired) if !expired.is_empty() => {
                warn!(count = expired.len(), "Transfers failed on deadline")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Deadline check failed"),
        }

        match self.manager.poll_status(&self.checkers).await {
            Ok(completed) if !completed.is_empty() => {
                info!(count = completed.len(), "Transfers completed by status check")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Status check failed"),
        }
    }
}

fn dispatch(manager: &Arc<TransferManager>, notification: DataPlaneNotification) {
    let manager = manager.clone();
    tokio::spawn(async move {
        let process_id = notification.process_id.clone();
        match manager.handle_notification(notification).await {
            Ok(process) => debug!(process_id = %process_id, state = %process.state, "Notification handled"),
            Err(TransferError::IllegalStateTransition { from, to, .. }) => info!(
                process_id = %process_id,
                %from,
                %to,
                "Notification lost the race; discarded"
            ),
            Err(e) => error!(process_id = %process_id, error = %e, "Notification handling failed"),
        }
    });
}

async fn run_event_loop(
    manager: Arc<TransferManager>,
    monitor: Monitor,
    mut notifications: mpsc::Receiver<DataPlaneNotification>,
    mut shutdown_rx: oneshot::Receiver<()>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs(), "Engine event loop started");

    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                dispatch(&manager, notification);
            }

            _ = ticker.tick() => {
                monitor.sweep().await;
            }

            _ = &mut shutdown_rx => {
                let mut drained = 0usize;
                while let Ok(notification) = notifications.try_recv() {
                    if let Err(e) = manager.handle_notification(notification).await {
                        debug!(error = %e, "Notification discarded during shutdown");
                    }
                    drained += 1;
                }
                info!(drained, "Engine event loop stopped");
                break;
            }
        }
    }
}
