//! Identity status store
//!
//! A key-value map from identity to [`IdentityStatus`]. There is no
//! compare-and-swap; one process drives the harvest.

use crate::state::IdentityStatus;
use crate::storage::{Database, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Per-identity status persistence
#[async_trait]
pub trait IdentityStateStore: Send + Sync {
    /// Reads an identity's status; absent entries are Pending
    async fn get(&self, identity: &str) -> StorageResult<IdentityStatus>;

    async fn set(&self, identity: &str, status: IdentityStatus) -> StorageResult<()>;
}

/// SQLite-backed status store
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db: Database,
}

impl SqliteStateStore {
    /// Wraps a database opened with the state schema
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of identities per stored status
    pub async fn count_by_status(&self) -> StorageResult<Vec<(IdentityStatus, i64)>> {
        self.db.call(|conn| count_statuses(conn)).await
    }
}

#[async_trait]
impl IdentityStateStore for SqliteStateStore {
    async fn get(&self, identity: &str) -> StorageResult<IdentityStatus> {
        let identity = identity.to_string();
        self.db
            .call(move |conn| {
                let stored: Option<String> = conn
                    .query_row(
                        "SELECT status FROM identity_status WHERE identity = ?1",
                        params![identity],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(IdentityStatus::from_stored(stored.as_deref()))
            })
            .await
    }

    async fn set(&self, identity: &str, status: IdentityStatus) -> StorageResult<()> {
        let identity = identity.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identity_status (identity, status, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(identity) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at",
                    params![identity, status.to_db_string(), Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }
}

/// Counts stored statuses; unknown values are counted as Pending
pub fn count_statuses(conn: &Connection) -> StorageResult<Vec<(IdentityStatus, i64)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM identity_status GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

    let mut counts: HashMap<IdentityStatus, i64> = HashMap::new();
    for row in rows {
        let (status, count) = row?;
        *counts
            .entry(IdentityStatus::from_stored(Some(&status)))
            .or_default() += count;
    }

    Ok(IdentityStatus::all_statuses()
        .into_iter()
        .filter_map(|s| counts.get(&s).map(|c| (s, *c)))
        .collect())
}

/// In-memory status store
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    statuses: Mutex<HashMap<String, IdentityStatus>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStateStore for MemoryStateStore {
    async fn get(&self, identity: &str) -> StorageResult<IdentityStatus> {
        let statuses = self.statuses.lock().await;
        Ok(statuses.get(identity).copied().unwrap_or_default())
    }

    async fn set(&self, identity: &str, status: IdentityStatus) -> StorageResult<()> {
        self.statuses
            .lock()
            .await
            .insert(identity.to_string(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SchemaKind;

    async fn exercise(store: &dyn IdentityStateStore) {
        assert_eq!(
            store.get("did:plc:new").await.unwrap(),
            IdentityStatus::Pending
        );

        store
            .set("did:plc:a", IdentityStatus::Processing)
            .await
            .unwrap();
        assert_eq!(
            store.get("did:plc:a").await.unwrap(),
            IdentityStatus::Processing
        );

        store
            .set("did:plc:a", IdentityStatus::Completed)
            .await
            .unwrap();
        assert_eq!(
            store.get("did:plc:a").await.unwrap(),
            IdentityStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let db = Database::open_in_memory(SchemaKind::State).unwrap();
        exercise(&SqliteStateStore::new(db)).await;
    }

    #[tokio::test]
    async fn test_status_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SqliteStateStore::new(Database::open(&path, SchemaKind::State).unwrap());
            store.set("did:plc:a", IdentityStatus::Failed).await.unwrap();
            store.set("did:plc:b", IdentityStatus::Retry).await.unwrap();
        }

        let store = SqliteStateStore::new(Database::open(&path, SchemaKind::State).unwrap());
        assert_eq!(store.get("did:plc:a").await.unwrap(), IdentityStatus::Failed);
        assert_eq!(store.get("did:plc:b").await.unwrap(), IdentityStatus::Retry);
    }

    #[tokio::test]
    async fn test_unknown_stored_value_reads_as_pending() {
        let db = Database::open_in_memory(SchemaKind::State).unwrap();
        db.call(|conn| {
            conn.execute(
                "INSERT INTO identity_status (identity, status, updated_at) VALUES ('did:plc:x', 'bogus', '')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let store = SqliteStateStore::new(db);
        assert_eq!(
            store.get("did:plc:x").await.unwrap(),
            IdentityStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let store = SqliteStateStore::new(Database::open_in_memory(SchemaKind::State).unwrap());
        store.set("a", IdentityStatus::Completed).await.unwrap();
        store.set("b", IdentityStatus::Completed).await.unwrap();
        store.set("c", IdentityStatus::Failed).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            vec![(IdentityStatus::Completed, 2), (IdentityStatus::Failed, 1)]
        );
    }
}
