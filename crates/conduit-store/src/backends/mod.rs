//! Backend implementations for TransferStore
//!
//! - `memory`: process-local map, lost on restart (always available)
//! - `redb`: pure Rust embedded database (requires `redb` feature)

pub mod memory;

#[cfg(feature = "redb")]
pub mod redb;
