//! In-memory backend
//!
//! Records live in a map behind a read-write lock. Each `save` swaps in a
//! complete clone under the write lock, so readers see either the old or the
//! new record. Nothing survives a restart.

use crate::{sort_oldest_first, StoreError, TransferProcess, TransferState, TransferStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Volatile transfer store
#[derive(Debug, Default)]
pub struct MemoryStore {
    processes: RwLock<HashMap<String, TransferProcess>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F>(&self, predicate: F) -> Vec<TransferProcess>
    where
        F: Fn(&TransferProcess) -> bool,
    {
        let processes = self.processes.read().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<_> = processes.values().filter(|p| predicate(p)).cloned().collect();
        sort_oldest_first(&mut matching);
        matching
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn save(&self, process: &TransferProcess) -> Result<(), StoreError> {
        let mut processes = self.processes.write().unwrap_or_else(PoisonError::into_inner);
        processes.insert(process.id.clone(), process.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<TransferProcess, StoreError> {
        let processes = self.processes.read().unwrap_or_else(PoisonError::into_inner);
        processes
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn find_by_state(&self, state: TransferState) -> Result<Vec<TransferProcess>, StoreError> {
        Ok(self.collect(|p| p.state == state))
    }

    async fn list(&self) -> Result<Vec<TransferProcess>, StoreError> {
        Ok(self.collect(|_| true))
    }
}
