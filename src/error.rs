/*!
 * Error types for Conduit
 */

use conduit_registry::TransportType;
use conduit_store::{StoreError, TerminalReason, TransferProcess, TransferState, TransitionError};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConduitError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_TRANSFER_FAILED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Errors surfaced by the transfer state machine
///
/// Selection and provisioning failures never travel past the state machine
/// as errors; they drive the process to FAILED and are recovered from the
/// record with [`TransferError::from_terminal`]. `Store` is the
/// infrastructure variant: the transition was not committed and the caller
/// decides whether to retry the whole operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("No eligible data plane for transport type {0}")]
    NoEligibleDataPlane(TransportType),

    #[error("Illegal state transition for {id}: {from} -> {to}")]
    IllegalStateTransition {
        id: String,
        from: TransferState,
        to: TransferState,
    },

    #[error("Provisioning exhausted after {attempts} attempts")]
    ProvisioningExhausted { attempts: u32 },

    #[error("Data plane timed out for transfer {0}")]
    DataPlaneTimeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transfer store unavailable: {0}")]
    Store(StoreError),
}

impl TransferError {
    /// Whether this is an infrastructure failure rather than a process outcome
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, TransferError::Store(_))
    }

    /// Error equivalent of a FAILED process, if it has one
    ///
    /// Completed and terminated processes yield `None`, as do failures
    /// reported by the data plane itself (their code lives on the record).
    pub fn from_terminal(process: &TransferProcess) -> Option<TransferError> {
        if process.state != TransferState::Failed {
            return None;
        }
        match process.reason.as_ref()? {
            TerminalReason::NoDataPlaneAvailable => Some(TransferError::NoEligibleDataPlane(
                process.transport_type.clone(),
            )),
            TerminalReason::ProvisioningExhausted => Some(TransferError::ProvisioningExhausted {
                attempts: process.retry_count,
            }),
            TerminalReason::DataPlaneTimeout => {
                Some(TransferError::DataPlaneTimeout(process.id.clone()))
            }
            TerminalReason::DataPlaneError(_) | TerminalReason::Cancelled => None,
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => TransferError::NotFound(id),
            other => TransferError::Store(other),
        }
    }
}

impl From<TransitionError> for TransferError {
    fn from(err: TransitionError) -> Self {
        TransferError::IllegalStateTransition {
            id: err.id,
            from: err.from,
            to: err.to,
        }
    }
}

/// Top-level error for configuration, startup and the CLI
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl ConduitError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ConduitError::Transfer(e) if !e.is_infrastructure() => EXIT_TRANSFER_FAILED,
            _ => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conduit_store::EndpointDescriptor;

    fn failed_with(reason: TerminalReason) -> TransferProcess {
        let mut p = TransferProcess::new(
            "tp-1",
            "c-1",
            EndpointDescriptor::new("a", "FILE"),
            EndpointDescriptor::new("b", "FILE"),
            "HTTP-PULL",
        );
        p.finish(TransferState::Failed, reason, None, Utc::now()).unwrap();
        p
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: TransferError = StoreError::NotFound("tp-9".to_string()).into();
        assert_eq!(err, TransferError::NotFound("tp-9".to_string()));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn test_store_failure_is_infrastructure() {
        let err: TransferError = StoreError::Database("disk gone".to_string()).into();
        assert!(err.is_infrastructure());
        assert_eq!(ConduitError::from(err).exit_code(), EXIT_FATAL);
    }

    #[test]
    fn test_from_terminal() {
        assert_eq!(
            TransferError::from_terminal(&failed_with(TerminalReason::NoDataPlaneAvailable)),
            Some(TransferError::NoEligibleDataPlane(TransportType::new("HTTP-PULL")))
        );
        assert_eq!(
            TransferError::from_terminal(&failed_with(TerminalReason::DataPlaneTimeout)),
            Some(TransferError::DataPlaneTimeout("tp-1".to_string()))
        );
        assert_eq!(
            TransferError::from_terminal(&failed_with(TerminalReason::DataPlaneError(
                "E42".to_string()
            ))),
            None
        );
    }

    #[test]
    fn test_transfer_error_exit_code() {
        let err = ConduitError::from(TransferError::ProvisioningExhausted { attempts: 3 });
        assert_eq!(err.exit_code(), EXIT_TRANSFER_FAILED);
    }
}
