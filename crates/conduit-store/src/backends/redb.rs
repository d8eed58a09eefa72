//! redb backend implementation
//!
//! Pure Rust embedded database. Each record is a bincode blob keyed by
//! process id; every `save` is its own write transaction, so a crash leaves
//! either the previous or the new record on disk.

use crate::{sort_oldest_first, StoreError, TransferProcess, TransferState, TransferStore};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::debug;

const PROCESSES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("transfer_processes");

fn db_err<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Database(err.into().to_string())
}

/// redb-backed transfer store
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;

        // Initialize tables
        let write_txn = db.begin_write().map_err(db_err)?;
        {
            let _processes = write_txn.open_table(PROCESSES_TABLE).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        debug!(path = %path.as_ref().display(), "Opened redb transfer store");
        Ok(Self { db })
    }

    fn serialize_process(process: &TransferProcess) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(process).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn deserialize_process(bytes: &[u8]) -> Result<TransferProcess, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn scan<F>(&self, predicate: F) -> Result<Vec<TransferProcess>, StoreError>
    where
        F: Fn(&TransferProcess) -> bool,
    {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(PROCESSES_TABLE).map_err(db_err)?;

        let mut processes = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (_, bytes) = item.map_err(db_err)?;
            let process = Self::deserialize_process(bytes.value())?;
            if predicate(&process) {
                processes.push(process);
            }
        }

        sort_oldest_first(&mut processes);
        Ok(processes)
    }
}

#[async_trait]
impl TransferStore for RedbStore {
    async fn save(&self, process: &TransferProcess) -> Result<(), StoreError> {
        let bytes = Self::serialize_process(process)?;

        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(PROCESSES_TABLE).map_err(db_err)?;
            table
                .insert(process.id.as_str(), bytes.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        Ok(())
    }

    async fn find(&self, id: &str) -> Result<TransferProcess, StoreError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(PROCESSES_TABLE).map_err(db_err)?;

        let guard = table
            .get(id)
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Self::deserialize_process(guard.value())
    }

    async fn find_by_state(&self, state: TransferState) -> Result<Vec<TransferProcess>, StoreError> {
        self.scan(|p| p.state == state)
    }

    async fn list(&self) -> Result<Vec<TransferProcess>, StoreError> {
        self.scan(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndpointDescriptor, TerminalReason};
    use chrono::Utc;
    use tempfile::tempdir;

    fn process(id: &str) -> TransferProcess {
        TransferProcess::new(
            id,
            "contract",
            EndpointDescriptor::new("in", "FILE").with_property("container", "src"),
            EndpointDescriptor::new("out", "FILE"),
            "FILE",
        )
    }

    #[tokio::test]
    async fn test_record_survives_encoding() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("transfers.redb")).unwrap();

        let mut p = process("tp-1");
        p.finish(
            TransferState::Failed,
            TerminalReason::DataPlaneError("SINK_WRITE_FAILED".to_string()),
            Some("disk full".to_string()),
            Utc::now(),
        )
        .unwrap();
        store.save(&p).await.unwrap();

        assert_eq!(store.find("tp-1").await.unwrap(), p);
    }

    #[tokio::test]
    async fn test_find_unknown() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("transfers.redb")).unwrap();
        assert!(store.find("missing").await.unwrap_err().is_not_found());
    }
}
