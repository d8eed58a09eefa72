//! Error types for the conduit-store crate

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Transfer process not found: {0}")]
    NotFound(String),

    #[error("Storage backend error: {0}")]
    Database(String),

    #[error("Failed to encode or decode process record: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
