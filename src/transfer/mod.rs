//! Transfer state machine
//!
//! [`TransferManager`] owns every transition of every transfer process:
//!
//! ```text
//!   submit ──► REQUESTED ──start──► PROVISIONING ──ack──► IN_PROGRESS ──completed──► COMPLETED
//!                  │                     │ reject (retry other instance)   │
//!                  │ no data plane       ▼                                 ▼ failed / deadline
//!                  └──────────────────► FAILED ◄───────────────────────────┘
//!
//!   terminate: any non-terminal state ──► TERMINATED
//! ```
//!
//! Each transition is validated against the persisted record, saved, and
//! only then published, all while holding the process's lock. Calls to a data
//! plane happen outside the lock; their results are re-validated on return,
//! so a cancellation that lands first always wins.

pub mod locks;
pub mod recovery;
pub mod retry;

pub use locks::{ProcessGuard, ProcessLocks};
pub use recovery::RecoveryReport;
pub use retry::RetryPolicy;

use crate::config::EngineConfig;
use crate::dataplane::{
    DataPlaneClients, DataPlaneError, DataPlaneNotification, InitiateRequest, NotificationKind,
    StatusCheckers,
};
use crate::error::TransferError;
use crate::events::{EventDispatcher, TransferEvent};
use chrono::{DateTime, Utc};
use conduit_registry::{Selector, TransportType};
use conduit_store::{
    EndpointDescriptor, StoreError, TerminalReason, TransferHandle, TransferProcess, TransferState,
    TransferStats, TransferStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

type TransferResult<T> = std::result::Result<T, TransferError>;

/// An authorized request to move data under a contract agreement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRequest {
    /// Process id; resubmitting the same id returns the existing process
    pub id: String,
    pub contract_id: String,
    pub source: EndpointDescriptor,
    pub destination: EndpointDescriptor,
    pub transport_type: TransportType,
}

impl TransferRequest {
    /// Request with a freshly generated process id
    pub fn new(
        contract_id: impl Into<String>,
        source: EndpointDescriptor,
        destination: EndpointDescriptor,
        transport_type: impl Into<TransportType>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contract_id: contract_id.into(),
            source,
            destination,
            transport_type: transport_type.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// One outstanding `initiate` call
#[derive(Debug, Clone)]
struct Attempt {
    instance_id: String,
    retry_count: u32,
    request: InitiateRequest,
}

impl Attempt {
    fn for_process(process: &TransferProcess) -> Option<Self> {
        process.selection.as_ref().map(|selection| Attempt {
            instance_id: selection.instance_id.clone(),
            retry_count: process.retry_count,
            request: InitiateRequest::for_process(process),
        })
    }

    /// Whether `process` is still waiting on this attempt
    fn is_current(&self, process: &TransferProcess) -> bool {
        process.state == TransferState::Provisioning
            && process.retry_count == self.retry_count
            && process
                .selection
                .as_ref()
                .is_some_and(|s| s.instance_id == self.instance_id)
    }
}

/// What to do after an attempt has been settled under the lock
enum Next {
    Done(TransferProcess),
    Retry(Attempt, Duration),
    /// Superseded; the handle was issued for a process that moved on
    Discard(TransferProcess, Option<(String, TransferHandle)>),
}

pub struct TransferManager {
    store: Arc<dyn TransferStore>,
    selector: Selector,
    clients: Arc<DataPlaneClients>,
    dispatcher: Arc<EventDispatcher>,
    locks: ProcessLocks,
    retry: RetryPolicy,
    max_attempts: u32,
    provisioning_timeout: Duration,
    deadline: Duration,
}

impl TransferManager {
    pub fn new(
        store: Arc<dyn TransferStore>,
        selector: Selector,
        clients: Arc<DataPlaneClients>,
        dispatcher: Arc<EventDispatcher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            selector,
            clients,
            dispatcher,
            locks: ProcessLocks::new(),
            retry: RetryPolicy::from_config(config),
            max_attempts: config.max_provisioning_attempts.max(1),
            provisioning_timeout: config.provisioning_timeout(),
            deadline: config.transfer_deadline(),
        }
    }

    /// Replace the provisioning backoff
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Look up one process
    pub async fn find(&self, id: &str) -> TransferResult<TransferProcess> {
        Ok(self.store.find(id).await?)
    }

    pub async fn list(&self) -> TransferResult<Vec<TransferProcess>> {
        Ok(self.store.list().await?)
    }

    pub async fn stats(&self) -> TransferResult<TransferStats> {
        Ok(self.store.stats().await?)
    }

    /// Record an authorized request as a new process in REQUESTED
    ///
    /// Idempotent by request id: an existing process is returned unchanged.
    pub async fn submit(&self, request: TransferRequest) -> TransferResult<TransferProcess> {
        let _guard = self.locks.acquire(&request.id).await;

        match self.store.find(&request.id).await {
            Ok(existing) => {
                debug!(process_id = %existing.id, state = %existing.state, "Transfer already submitted");
                return Ok(existing);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(TransferError::Store(e)),
        }

        let process = TransferProcess::new(
            request.id,
            request.contract_id,
            request.source,
            request.destination,
            request.transport_type,
        );
        self.store.save(&process).await?;
        info!(
            process_id = %process.id,
            contract_id = %process.contract_id,
            transport = %process.transport_type,
            "Transfer requested"
        );
        self.dispatcher.publish(&TransferEvent::for_commit(&process));
        Ok(process)
    }

    /// Select a data plane and provision the transfer
    ///
    /// Returns once the process is IN_PROGRESS or has failed. Selection and
    /// provisioning failures end in FAILED with a reason code and are not
    /// errors; `Err` means the call itself could not be carried out.
    pub async fn start(&self, id: &str) -> TransferResult<TransferProcess> {
        let attempt = {
            let _guard = self.locks.acquire(id).await;
            let mut process = self.store.find(id).await?;
            if let Err(e) = process.check_transition(TransferState::Provisioning) {
                warn!(process_id = %id, state = %process.state, "Rejected start; process already started");
                return Err(e.into());
            }

            match self
                .selector
                .selection(&process.transport_type, process.excluded_instances())
            {
                Ok(selection) => {
                    process.selection = Some(selection);
                    self.commit(&mut process, TransferState::Provisioning, None, Utc::now())
                        .await?;
                }
                Err(e) => {
                    warn!(process_id = %id, transport = %process.transport_type, error = %e, "No data plane available");
                    let detail = format!("no eligible data plane for {}", process.transport_type);
                    self.commit(
                        &mut process,
                        TransferState::Failed,
                        Some((TerminalReason::NoDataPlaneAvailable, Some(detail))),
                        Utc::now(),
                    )
                    .await?;
                    return Ok(process);
                }
            }

            match Attempt::for_process(&process) {
                Some(attempt) => attempt,
                None => return Ok(process),
            }
        };

        self.provision(id, attempt).await
    }

    /// Drive `initiate` calls until one is acknowledged or attempts run out
    async fn provision(&self, id: &str, mut attempt: Attempt) -> TransferResult<TransferProcess> {
        loop {
            debug!(process_id = %id, instance_id = %attempt.instance_id, attempt = attempt.retry_count + 1, "Initiating transfer");
            let outcome = self.initiate(&attempt).await;

            let next = {
                let _guard = self.locks.acquire(id).await;
                let process = self.store.find(id).await?;
                self.settle(process, &attempt, outcome).await?
            };

            match next {
                Next::Done(process) => return Ok(process),
                Next::Discard(process, orphan) => {
                    if let Some((instance_id, handle)) = orphan {
                        self.release(id, &instance_id, &handle).await;
                    }
                    return Ok(process);
                }
                Next::Retry(retry, delay) => {
                    if !delay.is_zero() {
                        debug!(process_id = %id, delay_ms = delay.as_millis() as u64, "Backing off before next data plane");
                        tokio::time::sleep(delay).await;
                    }

                    // Cancellation may have landed during the backoff
                    let _guard = self.locks.acquire(id).await;
                    let process = self.store.find(id).await?;
                    if !retry.is_current(&process) {
                        info!(process_id = %id, state = %process.state, "Provisioning abandoned; process moved on");
                        return Ok(process);
                    }
                    attempt = retry;
                }
            }
        }
    }

    /// One `initiate` call, bounded by the provisioning timeout
    async fn initiate(&self, attempt: &Attempt) -> Result<TransferHandle, DataPlaneError> {
        let Some(client) = self.clients.get(&attempt.instance_id) else {
            return Err(DataPlaneError::unavailable(
                &attempt.instance_id,
                "no client registered",
            ));
        };
        let call = client.initiate(attempt.request.clone());
        match tokio::time::timeout(self.provisioning_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DataPlaneError::unavailable(
                &attempt.instance_id,
                format!("no acknowledgment within {}s", self.provisioning_timeout.as_secs()),
            )),
        }
    }

    /// Apply the outcome of one `initiate` call; caller holds the lock
    async fn settle(
        &self,
        mut process: TransferProcess,
        attempt: &Attempt,
        outcome: Result<TransferHandle, DataPlaneError>,
    ) -> TransferResult<Next> {
        if !attempt.is_current(&process) {
            info!(
                process_id = %process.id,
                state = %process.state,
                instance_id = %attempt.instance_id,
                "Discarding provisioning response; process moved on"
            );
            // A handle the finished process never took over is released
            let orphan = match outcome {
                Ok(handle)
                    if process.is_terminal() && process.transfer_handle.as_ref() != Some(&handle) =>
                {
                    Some((attempt.instance_id.clone(), handle))
                }
                _ => None,
            };
            return Ok(Next::Discard(process, orphan));
        }

        match outcome {
            Ok(handle) => {
                info!(process_id = %process.id, instance_id = %attempt.instance_id, handle = %handle, "Data plane acknowledged transfer");
                process.transfer_handle = Some(handle);
                self.commit(&mut process, TransferState::InProgress, None, Utc::now())
                    .await?;
                Ok(Next::Done(process))
            }
            Err(e) => {
                process.failed_instances.push(attempt.instance_id.clone());
                process.retry_count += 1;
                process.last_error = Some(e.to_string());
                warn!(
                    process_id = %process.id,
                    instance_id = %attempt.instance_id,
                    attempt = process.retry_count,
                    max_attempts = self.max_attempts,
                    error = %e,
                    "Provisioning attempt failed"
                );

                if process.retry_count >= self.max_attempts {
                    let detail = format!("{} attempts failed, last: {}", process.retry_count, e);
                    self.commit(
                        &mut process,
                        TransferState::Failed,
                        Some((TerminalReason::ProvisioningExhausted, Some(detail))),
                        Utc::now(),
                    )
                    .await?;
                    return Ok(Next::Done(process));
                }

                match self
                    .selector
                    .selection(&process.transport_type, process.excluded_instances())
                {
                    Ok(selection) => {
                        process.selection = Some(selection);
                        process.updated_at = Utc::now();
                        self.store.save(&process).await?;
                    }
                    Err(_) => {
                        let detail = format!(
                            "no alternate data plane after {} failed attempts, last: {}",
                            process.retry_count, e
                        );
                        self.commit(
                            &mut process,
                            TransferState::Failed,
                            Some((TerminalReason::ProvisioningExhausted, Some(detail))),
                            Utc::now(),
                        )
                        .await?;
                        return Ok(Next::Done(process));
                    }
                }

                match Attempt::for_process(&process) {
                    Some(next) => Ok(Next::Retry(next, self.retry.delay(process.retry_count))),
                    None => Ok(Next::Done(process)),
                }
            }
        }
    }

    /// Route a data-plane notification to its transition
    pub async fn handle_notification(
        &self,
        notification: DataPlaneNotification,
    ) -> TransferResult<TransferProcess> {
        let DataPlaneNotification {
            process_id,
            handle,
            kind,
        } = notification;
        match kind {
            NotificationKind::Completed => self.on_completed(&process_id, &handle).await,
            NotificationKind::Failed { code, detail } => {
                self.on_failed(&process_id, &handle, &code, detail).await
            }
        }
    }

    /// `completed(handle)`: IN_PROGRESS → COMPLETED
    pub async fn on_completed(
        &self,
        id: &str,
        handle: &TransferHandle,
    ) -> TransferResult<TransferProcess> {
        self.finish_from_data_plane(id, handle, TransferState::Completed, None)
            .await
    }

    /// `failed(handle, reason)`: IN_PROGRESS → FAILED with the reported code
    ///
    /// Codes that collide with the engine's own reason codes are recorded
    /// with a `DATA_PLANE:` prefix.
    pub async fn on_failed(
        &self,
        id: &str,
        handle: &TransferHandle,
        code: &str,
        detail: Option<String>,
    ) -> TransferResult<TransferProcess> {
        let reason = TerminalReason::data_plane(code);
        self.finish_from_data_plane(id, handle, TransferState::Failed, Some((reason, detail)))
            .await
    }

    async fn finish_from_data_plane(
        &self,
        id: &str,
        handle: &TransferHandle,
        target: TransferState,
        reason: Option<(TerminalReason, Option<String>)>,
    ) -> TransferResult<TransferProcess> {
        let _guard = self.locks.acquire(id).await;
        let mut process = self.store.find(id).await?;

        // Outcome overtook the acknowledgment of `initiate`
        if process.state == TransferState::Provisioning && process.transfer_handle.is_none() {
            info!(process_id = %id, handle = %handle, "Notification ahead of acknowledgment; adopting handle");
            process.transfer_handle = Some(handle.clone());
            self.commit(&mut process, TransferState::InProgress, None, Utc::now())
                .await?;
        }

        if process.transfer_handle.as_ref() != Some(handle) {
            warn!(
                process_id = %id,
                handle = %handle,
                state = %process.state,
                "Discarding notification for a handle this process does not hold"
            );
            return Ok(process);
        }

        if let Err(e) = process.check_transition(target) {
            info!(process_id = %id, state = %process.state, target = %target, "Discarding late data-plane notification");
            return Err(e.into());
        }

        self.commit(&mut process, target, reason, Utc::now()).await?;
        Ok(process)
    }

    /// Cancel a process in any non-terminal state
    ///
    /// The TERMINATED commit is final; stopping the data plane afterwards is
    /// best effort.
    pub async fn terminate(
        &self,
        id: &str,
        detail: Option<String>,
    ) -> TransferResult<TransferProcess> {
        let process = {
            let _guard = self.locks.acquire(id).await;
            let mut process = self.store.find(id).await?;
            self.commit(
                &mut process,
                TransferState::Terminated,
                Some((TerminalReason::Cancelled, detail)),
                Utc::now(),
            )
            .await?;
            process
        };

        if let (Some(selection), Some(handle)) = (&process.selection, &process.transfer_handle) {
            self.release(id, &selection.instance_id, handle).await;
        }
        Ok(process)
    }

    /// Fail processes whose data plane went silent
    ///
    /// IN_PROGRESS processes are overdue once the transfer deadline has
    /// passed since they entered the state. PROVISIONING processes are
    /// overdue once no attempt has been recorded for twice the provisioning
    /// timeout plus the longest backoff, which only happens when the task
    /// driving them is gone. Returns the ids that timed out.
    pub async fn check_timeouts_at(&self, now: DateTime<Utc>) -> TransferResult<Vec<String>> {
        let mut expired = Vec::new();
        for state in [TransferState::Provisioning, TransferState::InProgress] {
            for candidate in self.store.find_by_state(state).await? {
                if !self.is_overdue(&candidate, now) {
                    continue;
                }

                let process = {
                    let _guard = self.locks.acquire(&candidate.id).await;
                    let mut process = self.store.find(&candidate.id).await?;
                    if process.state != state || !self.is_overdue(&process, now) {
                        continue;
                    }
                    let detail = match state {
                        TransferState::Provisioning => format!(
                            "no acknowledgment from {}",
                            process
                                .selection
                                .as_ref()
                                .map(|s| s.instance_id.as_str())
                                .unwrap_or("any data plane")
                        ),
                        _ => format!("no notification within {}s", self.deadline.as_secs()),
                    };
                    self.commit(
                        &mut process,
                        TransferState::Failed,
                        Some((TerminalReason::DataPlaneTimeout, Some(detail))),
                        now,
                    )
                    .await?;
                    process
                };

                if let (Some(selection), Some(handle)) = (&process.selection, &process.transfer_handle) {
                    self.release(&process.id, &selection.instance_id, handle).await;
                }
                expired.push(process.id);
            }
        }
        Ok(expired)
    }

    pub async fn check_timeouts(&self) -> TransferResult<Vec<String>> {
        self.check_timeouts_at(Utc::now()).await
    }

    fn is_overdue(&self, process: &TransferProcess, now: DateTime<Utc>) -> bool {
        let (since, limit) = match process.state {
            TransferState::Provisioning => (
                process.updated_at,
                self.provisioning_timeout * 2 + self.retry.max_delay,
            ),
            TransferState::InProgress => (process.state_entered_at(), self.deadline),
            _ => return false,
        };
        (now - since).to_std().is_ok_and(|elapsed| elapsed > limit)
    }

    /// Ask status checkers about IN_PROGRESS processes
    ///
    /// A checker reporting complete drives the process to COMPLETED. Returns
    /// the ids completed this way.
    pub async fn poll_status(&self, checkers: &StatusCheckers) -> TransferResult<Vec<String>> {
        if checkers.is_empty() {
            return Ok(Vec::new());
        }

        let mut completed = Vec::new();
        for candidate in self.store.find_by_state(TransferState::InProgress).await? {
            let Some(checker) = checkers.for_process(&candidate) else {
                continue;
            };
            if !checker.is_complete(&candidate).await {
                continue;
            }

            let _guard = self.locks.acquire(&candidate.id).await;
            let mut process = self.store.find(&candidate.id).await?;
            if process.state != TransferState::InProgress {
                continue;
            }
            info!(process_id = %process.id, "Status check reports transfer complete");
            self.commit(&mut process, TransferState::Completed, None, Utc::now())
                .await?;
            completed.push(process.id);
        }
        Ok(completed)
    }

    /// Validate, persist, then publish one transition; caller holds the lock
    ///
    /// `process` is left untouched unless the save succeeds.
    async fn commit(
        &self,
        process: &mut TransferProcess,
        target: TransferState,
        reason: Option<(TerminalReason, Option<String>)>,
        at: DateTime<Utc>,
    ) -> TransferResult<()> {
        let mut next = process.clone();
        let applied = match reason {
            Some((reason, detail)) => next.finish(target, reason, detail, at),
            None => next.apply(target, at),
        };
        if let Err(e) = applied {
            warn!(process_id = %process.id, state = %process.state, target = %target, "Rejected illegal transition");
            return Err(e.into());
        }

        self.store.save(&next).await?;
        *process = next;

        info!(
            process_id = %process.id,
            state = %process.state,
            instance_id = process.selection.as_ref().map(|s| s.instance_id.as_str()).unwrap_or("-"),
            reason = process.reason.as_ref().map(|r| r.code()).unwrap_or("-"),
            "Transfer transition committed"
        );
        self.dispatcher.publish(&TransferEvent::for_commit(process));
        Ok(())
    }

    /// Best-effort `terminate(handle)` on the data plane that holds it
    async fn release(&self, process_id: &str, instance_id: &str, handle: &TransferHandle) {
        let Some(client) = self.clients.get(instance_id) else {
            debug!(process_id, instance_id, "No client to release transfer handle");
            return;
        };
        match client.terminate(handle).await {
            Ok(()) => debug!(process_id, instance_id, handle = %handle, "Data plane released transfer"),
            Err(e) => warn!(process_id, instance_id, handle = %handle, error = %e, "Data plane terminate failed"),
        }
    }
}
