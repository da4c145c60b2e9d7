//! Storage traits and error types
//!
//! This module defines the bulk-insert seam used by the batch queues and
//! the associated error types.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking database task failed: {0}")]
    Task(String),

    #[error("Database connection lock poisoned")]
    Poisoned,

    #[error("Insert failed: {0}")]
    Insert(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Bulk insert of a batch of entities
///
/// Implementations insert the whole batch inside one transaction: either
/// every row lands or none does.
#[async_trait]
pub trait BatchInserter<T>: Send + Sync {
    async fn insert_batch(&self, batch: &[T]) -> StorageResult<()>;
}
