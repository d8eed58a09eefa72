//! Conduit Store: durable transfer-process records
//!
//! # Overview
//!
//! This crate holds the [`TransferProcess`] record, the state table it moves
//! through, and the [`TransferStore`] trait that persists it. The store is
//! the single authority for process durability: the transfer state machine
//! commits every transition here before anyone is told about it, and a
//! restarted engine reads non-terminal processes back to re-drive them.
//!
//! # Features
//!
//! - **Atomic upsert**: a reader never observes a half-written record
//! - **Recovery queries**: `find_by_state` for the restart sweep
//! - **Multiple Backends**: in-memory and redb (pure Rust, default)
//!
//! # Example
//!
//! ```
//! use conduit_store::{EndpointDescriptor, MemoryStore, TransferProcess, TransferStore};
//!
//! # async fn example() -> Result<(), conduit_store::StoreError> {
//! let store = MemoryStore::new();
//! let process = TransferProcess::new(
//!     "tp-1",
//!     "contract-7",
//!     EndpointDescriptor::new("/data/in.bin", "FILE"),
//!     EndpointDescriptor::new("/data/out.bin", "FILE"),
//!     "FILE",
//! );
//!
//! store.save(&process).await?;
//! assert_eq!(store.find("tp-1").await?.contract_id, "contract-7");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub mod backends;
pub mod error;
pub mod process;

pub use backends::memory::MemoryStore;

#[cfg(feature = "redb")]
pub use backends::redb::RedbStore;

pub use error::StoreError;
pub use process::{
    EndpointDescriptor, StateEntry, TerminalReason, TransferHandle, TransferProcess,
    TransferState, TransitionError,
};

/// Core trait for transfer-process persistence backends
///
/// Implementations must make `save` atomic per id and safe to call
/// concurrently for different ids.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert or replace the record with `process.id`
    async fn save(&self, process: &TransferProcess) -> Result<(), StoreError>;

    /// Fetch one process
    ///
    /// Returns `StoreError::NotFound` for unknown ids.
    async fn find(&self, id: &str) -> Result<TransferProcess, StoreError>;

    /// All processes currently in `state`, oldest first
    async fn find_by_state(&self, state: TransferState) -> Result<Vec<TransferProcess>, StoreError>;

    /// Every stored process, oldest first
    async fn list(&self) -> Result<Vec<TransferProcess>, StoreError>;

    /// Processes that still need driving, oldest first
    async fn find_non_terminal(&self) -> Result<Vec<TransferProcess>, StoreError> {
        let mut pending = Vec::new();
        for state in TransferState::NON_TERMINAL {
            pending.extend(self.find_by_state(state).await?);
        }
        sort_oldest_first(&mut pending);
        Ok(pending)
    }

    /// Counts per state
    async fn stats(&self) -> Result<TransferStats, StoreError> {
        let mut stats = TransferStats::default();
        for process in self.list().await? {
            stats.record(process.state);
        }
        Ok(stats)
    }
}

/// Process counts per state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferStats {
    pub total: u64,
    pub requested: u64,
    pub provisioning: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub terminated: u64,
}

impl TransferStats {
    pub fn record(&mut self, state: TransferState) {
        self.total += 1;
        match state {
            TransferState::Requested => self.requested += 1,
            TransferState::Provisioning => self.provisioning += 1,
            TransferState::InProgress => self.in_progress += 1,
            TransferState::Completed => self.completed += 1,
            TransferState::Failed => self.failed += 1,
            TransferState::Terminated => self.terminated += 1,
        }
    }

    /// Processes not yet in a terminal state
    pub fn active(&self) -> u64 {
        self.requested + self.provisioning + self.in_progress
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

pub(crate) fn sort_oldest_first(processes: &mut [TransferProcess]) {
    processes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Open a store
///
/// `None` gives an in-memory store. A path opens (or creates) a redb file.
#[allow(clippy::needless_return)]
pub fn open(path: Option<&Path>) -> Result<Arc<dyn TransferStore>, StoreError> {
    let Some(path) = path else {
        return Ok(Arc::new(MemoryStore::new()));
    };

    #[cfg(feature = "redb")]
    {
        let store = RedbStore::open(path)?;
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "redb"))]
    Err(StoreError::Database(format!(
        "No durable backend available for {}. Enable the 'redb' feature.",
        path.display()
    )))
}
