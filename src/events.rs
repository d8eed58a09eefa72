/*!
 * Transfer event dispatch
 *
 * Every committed transition is published as a [`TransferEvent`] to the
 * registered listeners. Publishing is fire-and-forget: a listener that
 * errors or panics is logged and skipped, and the transition that produced
 * the event is unaffected.
 */

use chrono::{DateTime, Utc};
use conduit_store::{TerminalReason, TransferProcess, TransferState};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A committed state transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferEvent {
    pub process_id: String,

    /// State before the transition (`None` for creation)
    pub from: Option<TransferState>,

    pub to: TransferState,

    /// Position of this transition in the process history, starting at 0
    pub sequence: usize,

    /// Data plane responsible at commit time
    pub data_plane_id: Option<String>,

    /// Terminal reason, for terminal transitions
    pub reason: Option<TerminalReason>,

    pub reason_detail: Option<String>,

    pub at: DateTime<Utc>,
}

impl TransferEvent {
    /// Build the event for the latest committed state of `process`
    pub fn for_commit(process: &TransferProcess) -> Self {
        let sequence = process.history.len().saturating_sub(1);
        let from = sequence
            .checked_sub(1)
            .and_then(|i| process.history.get(i))
            .map(|entry| entry.state);
        Self {
            process_id: process.id.clone(),
            from,
            to: process.state,
            sequence,
            data_plane_id: process.selection.as_ref().map(|s| s.instance_id.clone()),
            reason: process.reason.clone(),
            reason_detail: process.reason_detail.clone(),
            at: process.state_entered_at(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Listener {listener} failed: {message}")]
pub struct ListenerError {
    pub listener: String,
    pub message: String,
}

impl ListenerError {
    pub fn new(listener: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            message: message.into(),
        }
    }
}

/// Receiver of transfer events
///
/// Called synchronously in commit order for each process; implementations
/// that do real work should hand the event off rather than block.
pub trait TransferListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &TransferEvent) -> Result<(), ListenerError>;
}

/// Forwards events into an unbounded channel
pub struct ChannelListener {
    name: String,
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelListener {
    pub fn new(name: impl Into<String>, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

impl TransferListener for ChannelListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: &TransferEvent) -> Result<(), ListenerError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ListenerError::new(&self.name, "receiver dropped"))
    }
}

/// Writes each event to the log
pub struct LoggingListener;

impl TransferListener for LoggingListener {
    fn name(&self) -> &str {
        "log"
    }

    fn on_event(&self, event: &TransferEvent) -> Result<(), ListenerError> {
        info!(
            process_id = %event.process_id,
            to = %event.to,
            sequence = event.sequence,
            data_plane = event.data_plane_id.as_deref().unwrap_or("-"),
            reason = event.reason.as_ref().map(|r| r.code()).unwrap_or("-"),
            "Transfer state committed"
        );
        Ok(())
    }
}

/// Fans transfer events out to listeners
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn TransferListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn TransferListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        info!(listener = listener.name(), "Registered transfer listener");
        listeners.push(listener);
    }

    /// Register a channel listener and return its receiving end
    pub fn subscribe(&self, name: &str) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(Arc::new(ChannelListener::new(name, tx)));
        rx
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every listener
    ///
    /// Never fails; listener errors and panics are logged per listener.
    pub fn publish(&self, event: &TransferEvent) {
        // Snapshot so a listener may register others without deadlocking
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    listener = listener.name(),
                    process_id = %event.process_id,
                    error = %e,
                    "Transfer listener failed"
                ),
                Err(_) => error!(
                    listener = listener.name(),
                    process_id = %event.process_id,
                    "Transfer listener panicked"
                ),
            }
        }
    }
}
