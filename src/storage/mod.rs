//! Storage module for persisting harvest data
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Bulk insertion of posts, profiles and their emoji rows
//! - The batching queues sitting in front of those inserts

mod batch_queue;
mod schema;
mod sqlite;
mod traits;

pub use batch_queue::{BatchQueue, BatchQueueConfig, QueueError};
pub use schema::{initialize_schema, SchemaKind, OUTPUT_TABLES};
pub use sqlite::{
    count_output_rows, insert_posts, insert_profiles, Database, PostInserter, ProfileInserter,
};
pub use traits::{BatchInserter, StorageError, StorageResult};

use std::path::Path;

/// Opens the output database (posts, profiles, emoji rows)
pub fn open_output_database(path: &Path) -> StorageResult<Database> {
    Database::open(path, SchemaKind::Output)
}

/// Opens the state database (identity statuses, advisory counters)
pub fn open_state_database(path: &Path) -> StorageResult<Database> {
    Database::open(path, SchemaKind::State)
}
