//! Per-actor persistent storage
//!
//! This module contains the storage primitives:
//! - [`InstanceStore`] trait over an actor's private tables
//! - [`StorageBackend`] factory opening one store per actor name
//! - [`MemoryBackend`] for tests and embedded use
//! - [`SqliteBackend`] for durable storage

mod memory;
mod migrations;
mod sqlite;
mod store;

pub use memory::{MemoryBackend, MemoryStore};
pub use migrations::MIGRATIONS;
pub use sqlite::{SqliteBackend, SqliteStore};
pub use store::{
    EventBufferRow, IndexEntry, InstanceStore, LiveMessageRow, RetryAttempt, StepRow, StepStatus,
    StepType, StorageBackend, StoreError, WorkflowRow, WorkflowStatus,
};
