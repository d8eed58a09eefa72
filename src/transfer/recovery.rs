//! Restart sweep over processes left in non-terminal states
//!
//! - REQUESTED: started as if freshly submitted.
//! - PROVISIONING with a handle: the data plane already accepted; the
//!   process moves to IN_PROGRESS without another `initiate`.
//! - PROVISIONING without a handle: `initiate` is repeated against the same
//!   selection. Data planes answer repeated calls for a process id with the
//!   handle they already issued.
//! - IN_PROGRESS: left alone; the deadline counts from when the state was
//!   entered, so a data plane that died with the engine still times out.

use super::{Attempt, TransferManager, TransferResult};
use chrono::Utc;
use conduit_store::{TerminalReason, TransferState};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Outcome of one recovery sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryReport {
    /// REQUESTED processes started
    pub started: usize,
    /// PROVISIONING processes whose stored handle was adopted
    pub adopted: usize,
    /// PROVISIONING processes re-sent to their selected data plane
    pub reinitiated: usize,
    /// IN_PROGRESS processes left waiting for a notification
    pub awaiting: usize,
    /// Processes whose recovery returned an error
    pub errors: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.started + self.adopted + self.reinitiated + self.awaiting + self.errors
    }
}

impl TransferManager {
    /// Re-drive every stored non-terminal process, oldest first
    ///
    /// Errors for individual processes are logged and counted; only failing
    /// to read the store aborts the sweep.
    pub async fn recover(&self) -> TransferResult<RecoveryReport> {
        let pending = self.store.find_non_terminal().await?;
        let mut report = RecoveryReport::default();
        info!(pending = pending.len(), "Recovery sweep started");

        for process in pending {
            let id = process.id.clone();
            let result = match process.state {
                TransferState::Requested => self.start(&id).await.map(|_| report.started += 1),
                TransferState::Provisioning => self.resume_provisioning(&id, &mut report).await,
                TransferState::InProgress => {
                    report.awaiting += 1;
                    Ok(())
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                error!(process_id = %id, error = %e, "Recovery failed for transfer");
                report.errors += 1;
            }
        }

        info!(
            started = report.started,
            adopted = report.adopted,
            reinitiated = report.reinitiated,
            awaiting = report.awaiting,
            errors = report.errors,
            "Recovery sweep finished"
        );
        Ok(report)
    }

    async fn resume_provisioning(&self, id: &str, report: &mut RecoveryReport) -> TransferResult<()> {
        let attempt = {
            let _guard = self.locks.acquire(id).await;
            let mut process = self.store.find(id).await?;
            if process.state != TransferState::Provisioning {
                return Ok(());
            }

            if process.transfer_handle.is_some() {
                info!(process_id = %id, "Adopting stored transfer handle");
                self.commit(&mut process, TransferState::InProgress, None, Utc::now())
                    .await?;
                report.adopted += 1;
                return Ok(());
            }

            match Attempt::for_process(&process) {
                Some(attempt) => attempt,
                None => {
                    warn!(process_id = %id, "Provisioning record has no selection");
                    let detail = "provisioning record lost its data plane selection".to_string();
                    self.commit(
                        &mut process,
                        TransferState::Failed,
                        Some((TerminalReason::NoDataPlaneAvailable, Some(detail))),
                        Utc::now(),
                    )
                    .await?;
                    return Ok(());
                }
            }
        };

        info!(process_id = %id, instance_id = %attempt.instance_id, "Re-sending initiate after restart");
        report.reinitiated += 1;
        self.provision(id, attempt).await.map(|_| ())
    }
}
