//! Completion probes for transfers whose data plane may never call back

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_registry::TransportType;
use conduit_store::{TransferProcess, TransferState};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Decides from the outside whether an IN_PROGRESS transfer has finished
///
/// Checkers are keyed by the transport type of the process destination.
#[async_trait]
pub trait StatusChecker: Send + Sync {
    fn transport_type(&self) -> TransportType;

    async fn is_complete(&self, process: &TransferProcess) -> bool;
}

/// Complete once the destination is a regular file written after
/// provisioning began
///
/// A file already present when the transfer started does not count.
pub struct FileStatusChecker;

#[async_trait]
impl StatusChecker for FileStatusChecker {
    fn transport_type(&self) -> TransportType {
        TransportType::new(super::pipeline::FILE)
    }

    async fn is_complete(&self, process: &TransferProcess) -> bool {
        let path = Path::new(&process.destination.address);
        let Some(started) = process
            .history
            .iter()
            .find(|entry| entry.state == TransferState::Provisioning)
            .map(|entry| entry.entered_at)
        else {
            return false;
        };

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => match meta.modified() {
                Ok(modified) => DateTime::<Utc>::from(modified) > started,
                Err(e) => {
                    debug!(process_id = %process.id, error = %e, "Destination has no modification time");
                    false
                }
            },
            Ok(_) => false,
            Err(e) => {
                debug!(process_id = %process.id, path = %path.display(), error = %e, "Destination not present yet");
                false
            }
        }
    }
}

#[derive(Default)]
pub struct StatusCheckers {
    checkers: RwLock<HashMap<TransportType, Arc<dyn StatusChecker>>>,
}

impl StatusCheckers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, checker: Arc<dyn StatusChecker>) {
        self.checkers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(checker.transport_type(), checker);
    }

    /// Checker for the destination of `process`, if any
    pub fn for_process(&self, process: &TransferProcess) -> Option<Arc<dyn StatusChecker>> {
        self.checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&process.destination.transport_type)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_store::EndpointDescriptor;
    use tempfile::tempdir;

    fn process_writing_to(dst: &Path, transport: &str) -> TransferProcess {
        TransferProcess::new(
            "tp-1",
            "c-1",
            EndpointDescriptor::new("/in", "FILE"),
            EndpointDescriptor::new(dst.to_string_lossy(), transport),
            "FILE",
        )
    }

    fn provisioned_at(mut process: TransferProcess, at: DateTime<Utc>) -> TransferProcess {
        process.apply(TransferState::Provisioning, at).unwrap();
        process.apply(TransferState::InProgress, at).unwrap();
        process
    }

    #[tokio::test]
    async fn test_file_checker_waits_for_file() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let started = Utc::now() - chrono::Duration::seconds(60);
        let process = provisioned_at(process_writing_to(&dst, "FILE"), started);

        assert!(!FileStatusChecker.is_complete(&process).await);
        std::fs::write(&dst, b"done").unwrap();
        assert!(FileStatusChecker.is_complete(&process).await);
    }

    #[tokio::test]
    async fn test_file_present_before_provisioning_is_not_complete() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        std::fs::write(&dst, b"stale").unwrap();

        let started = Utc::now() + chrono::Duration::seconds(1);
        let process = provisioned_at(process_writing_to(&dst, "FILE"), started);
        assert!(!FileStatusChecker.is_complete(&process).await);
    }

    #[tokio::test]
    async fn test_unprovisioned_process_is_not_complete() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        std::fs::write(&dst, b"x").unwrap();
        assert!(!FileStatusChecker.is_complete(&process_writing_to(&dst, "FILE")).await);
    }

    #[tokio::test]
    async fn test_directory_is_not_complete() {
        let dir = tempdir().unwrap();
        let started = Utc::now() - chrono::Duration::seconds(60);
        let process = provisioned_at(process_writing_to(dir.path(), "FILE"), started);
        assert!(!FileStatusChecker.is_complete(&process).await);
    }

    #[test]
    fn test_lookup_by_destination_transport() {
        let checkers = StatusCheckers::new();
        checkers.register(Arc::new(FileStatusChecker));

        let dir = tempdir().unwrap();
        assert!(checkers.for_process(&process_writing_to(dir.path(), "file")).is_some());
        assert!(checkers
            .for_process(&process_writing_to(dir.path(), "AZURE-BLOB"))
            .is_none());
    }
}
