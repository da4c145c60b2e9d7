//! SQLite storage implementation
//!
//! A [`Database`] wraps one connection behind a mutex; all statements run on
//! the blocking thread pool. Posts and profiles are written with multi-row
//! inserts whose `RETURNING` rows are joined back to the batch through the
//! natural key (did, cid, rkey) to attach the emoji child rows.

use crate::output::StatsAggregator;
use crate::records::{PostRecord, ProfileRecord};
use crate::storage::schema::{initialize_schema, SchemaKind, OUTPUT_TABLES};
use crate::storage::traits::{BatchInserter, StorageError, StorageResult};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Rows per multi-row statement; keeps bound parameters well below
/// SQLite's variable limit.
const ROWS_PER_STATEMENT: usize = 500;

type NaturalKey = (String, String, String);

/// Shared SQLite connection
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) a database file and initializes its schema
    pub fn open(path: &Path, kind: SchemaKind) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn, kind)?;
        Ok(Self::from_connection(conn))
    }

    /// Creates an in-memory database
    pub fn open_in_memory(kind: SchemaKind) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn, kind)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs a closure against the connection on the blocking thread pool
    pub async fn call<F, R>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut Connection) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Inserts a batch of posts and their emoji rows in one transaction
///
/// Rows already present (same did, cid, rkey) are skipped. Returns the
/// indices, within `batch`, of the posts actually inserted.
pub fn insert_posts(conn: &mut Connection, batch: &[PostRecord]) -> StorageResult<Vec<usize>> {
    let tx = conn.transaction()?;
    let mut inserted = Vec::new();
    let mut emoji_rows = Vec::new();

    for (offset, chunk) in chunk_offsets(batch) {
        let mut params = Vec::with_capacity(chunk.len() * 7);
        for post in chunk {
            params.push(Value::Text(post.content_hash.clone()));
            params.push(Value::Text(post.identity.clone()));
            params.push(Value::Text(post.record_key.clone()));
            params.push(Value::Integer(post.has_emojis as i64));
            params.push(Value::Text(serde_json::to_string(&post.languages)?));
            params.push(Value::Text(post.text.clone()));
            params.push(Value::Text(post.created_at.clone()));
        }

        let returned = insert_returning(
            &tx,
            "posts",
            &["cid", "did", "rkey", "has_emojis", "langs", "text", "created_at"],
            chunk.len(),
            params,
        )?;

        let mut pending = index_by_key(chunk.iter().map(|p| p.natural_key()));
        for (post_id, key) in returned {
            let Some(index) = pending.remove(&key) else {
                continue;
            };
            let post = &chunk[index];
            for emoji in &post.emojis {
                for lang in &post.languages {
                    emoji_rows.push(vec![
                        Value::Integer(post_id),
                        Value::Text(emoji.clone()),
                        Value::Text(lang.clone()),
                        Value::Text(post.created_at.clone()),
                    ]);
                }
            }
            inserted.push(offset + index);
        }
    }

    insert_rows(&tx, "post_emojis", &["post_id", "emoji", "lang", "created_at"], emoji_rows)?;
    tx.commit()?;

    inserted.sort_unstable();
    Ok(inserted)
}

/// Inserts a batch of profiles and their emoji rows in one transaction
///
/// Returns the indices, within `batch`, of the profiles actually inserted.
pub fn insert_profiles(
    conn: &mut Connection,
    batch: &[ProfileRecord],
) -> StorageResult<Vec<usize>> {
    let tx = conn.transaction()?;
    let mut inserted = Vec::new();
    let mut display_name_rows = Vec::new();
    let mut description_rows = Vec::new();

    for (offset, chunk) in chunk_offsets(batch) {
        let mut params = Vec::with_capacity(chunk.len() * 8);
        for profile in chunk {
            params.push(Value::Text(profile.content_hash.clone()));
            params.push(Value::Text(profile.identity.clone()));
            params.push(Value::Text(profile.record_key.clone()));
            params.push(Value::Text(profile.display_name.clone()));
            params.push(Value::Text(profile.description.clone()));
            params.push(Value::Text(profile.created_at.clone()));
            params.push(Value::Integer(profile.has_display_name_emojis as i64));
            params.push(Value::Integer(profile.has_description_emojis as i64));
        }

        let returned = insert_returning(
            &tx,
            "profiles",
            &[
                "cid",
                "did",
                "rkey",
                "display_name",
                "description",
                "created_at",
                "has_display_name_emojis",
                "has_description_emojis",
            ],
            chunk.len(),
            params,
        )?;

        let mut pending = index_by_key(chunk.iter().map(|p| p.natural_key()));
        for (profile_id, key) in returned {
            let Some(index) = pending.remove(&key) else {
                continue;
            };
            let profile = &chunk[index];
            for emoji in &profile.display_name_emojis {
                display_name_rows.push(emoji_row(profile_id, emoji, &profile.created_at));
            }
            for emoji in &profile.description_emojis {
                description_rows.push(emoji_row(profile_id, emoji, &profile.created_at));
            }
            inserted.push(offset + index);
        }
    }

    let columns = ["profile_id", "emoji", "created_at"];
    insert_rows(&tx, "profile_display_name_emojis", &columns, display_name_rows)?;
    insert_rows(&tx, "profile_description_emojis", &columns, description_rows)?;
    tx.commit()?;

    inserted.sort_unstable();
    Ok(inserted)
}

/// Row counts of every output table
pub fn count_output_rows(conn: &Connection) -> StorageResult<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(OUTPUT_TABLES.len());
    for table in OUTPUT_TABLES {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        counts.push((table, count));
    }
    Ok(counts)
}

fn chunk_offsets<T>(batch: &[T]) -> impl Iterator<Item = (usize, &[T])> + '_ {
    batch
        .chunks(ROWS_PER_STATEMENT)
        .enumerate()
        .map(|(i, chunk)| (i * ROWS_PER_STATEMENT, chunk))
}

/// Maps natural keys to their first position in a chunk
fn index_by_key<'a>(
    keys: impl Iterator<Item = (&'a str, &'a str, &'a str)>,
) -> HashMap<NaturalKey, usize> {
    let mut index = HashMap::new();
    for (i, (did, cid, rkey)) in keys.enumerate() {
        index
            .entry((did.to_string(), cid.to_string(), rkey.to_string()))
            .or_insert(i);
    }
    index
}

fn emoji_row(parent_id: i64, emoji: &str, created_at: &str) -> Vec<Value> {
    vec![
        Value::Integer(parent_id),
        Value::Text(emoji.to_string()),
        Value::Text(created_at.to_string()),
    ]
}

fn placeholders(columns: usize, rows: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(", "));
    vec![row; rows].join(", ")
}

/// Multi-row insert of parent rows, skipping conflicts
///
/// Returns (id, natural key) for every row actually inserted.
fn insert_returning(
    tx: &Transaction<'_>,
    table: &str,
    columns: &[&str],
    rows: usize,
    params: Vec<Value>,
) -> StorageResult<Vec<(i64, NaturalKey)>> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT(did, cid, rkey) DO NOTHING RETURNING id, did, cid, rkey",
        table,
        columns.join(", "),
        placeholders(columns.len(), rows)
    );

    let mut stmt = tx.prepare(&sql)?;
    let returned: Vec<(i64, NaturalKey)> = stmt
        .query_map(params_from_iter(params), |row| {
            Ok((row.get(0)?, (row.get(1)?, row.get(2)?, row.get(3)?)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(returned)
}

/// Multi-row insert of child rows
fn insert_rows(
    tx: &Transaction<'_>,
    table: &str,
    columns: &[&str],
    rows: Vec<Vec<Value>>,
) -> StorageResult<()> {
    for chunk in rows.chunks(ROWS_PER_STATEMENT) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table,
            columns.join(", "),
            placeholders(columns.len(), chunk.len())
        );
        let params = chunk.iter().flatten().cloned();
        tx.execute(&sql, params_from_iter(params))?;
    }
    Ok(())
}

/// Bulk inserter for posts
#[derive(Debug, Clone)]
pub struct PostInserter {
    db: Database,
    stats: Option<StatsAggregator>,
}

impl PostInserter {
    pub fn new(db: Database, stats: Option<StatsAggregator>) -> Self {
        Self { db, stats }
    }
}

#[async_trait]
impl BatchInserter<PostRecord> for PostInserter {
    async fn insert_batch(&self, batch: &[PostRecord]) -> StorageResult<()> {
        let rows = batch.to_vec();
        let inserted = self
            .db
            .call(move |conn| {
                let indices = insert_posts(conn, &rows)?;
                Ok(indices.into_iter().map(|i| rows[i].clone()).collect::<Vec<_>>())
            })
            .await?;

        if inserted.len() < batch.len() {
            tracing::debug!(
                "Skipped {} already stored posts",
                batch.len() - inserted.len()
            );
        }

        if let Some(stats) = &self.stats {
            stats.record_posts(&inserted).await;
        }
        Ok(())
    }
}

/// Bulk inserter for profiles
#[derive(Debug, Clone)]
pub struct ProfileInserter {
    db: Database,
    stats: Option<StatsAggregator>,
}

impl ProfileInserter {
    pub fn new(db: Database, stats: Option<StatsAggregator>) -> Self {
        Self { db, stats }
    }
}

#[async_trait]
impl BatchInserter<ProfileRecord> for ProfileInserter {
    async fn insert_batch(&self, batch: &[ProfileRecord]) -> StorageResult<()> {
        let rows = batch.to_vec();
        let inserted = self
            .db
            .call(move |conn| {
                let indices = insert_profiles(conn, &rows)?;
                Ok(indices.into_iter().map(|i| rows[i].clone()).collect::<Vec<_>>())
            })
            .await?;

        if let Some(stats) = &self.stats {
            stats.record_profiles(&inserted).await;
        }
        Ok(())
    }
}
