//! Advisory harvest counters
//!
//! Emoji frequencies, language distribution and processed totals are kept in
//! the state database. Each flushed batch updates all of its counters in one
//! transaction; failures are logged and otherwise ignored.

use crate::records::{PostRecord, ProfileRecord};
use crate::state::{count_statuses, IdentityStatus};
use crate::storage::{count_output_rows, Database, StorageResult};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

/// Counter names
pub mod counters {
    pub const PROCESSED_POSTS: &str = "processed_posts";
    pub const POSTS_WITH_EMOJIS: &str = "posts_with_emojis";
    pub const POSTS_WITHOUT_EMOJIS: &str = "posts_without_emojis";
    pub const PROCESSED_EMOJIS: &str = "processed_emojis";
    pub const PROCESSED_PROFILES: &str = "processed_profiles";
    pub const DISPLAY_NAMES_WITH_EMOJIS: &str = "display_names_with_emojis";
    pub const DISPLAY_NAMES_WITHOUT_EMOJIS: &str = "display_names_without_emojis";
    pub const DESCRIPTIONS_WITH_EMOJIS: &str = "descriptions_with_emojis";
    pub const DESCRIPTIONS_WITHOUT_EMOJIS: &str = "descriptions_without_emojis";

    /// Per-emoji frequency in post text
    pub const POST_EMOJIS: &str = "post_emojis";
    /// Per-emoji frequency in profile display names
    pub const DISPLAY_NAME_EMOJIS: &str = "display_name_emojis";
    /// Per-emoji frequency in profile descriptions
    pub const DESCRIPTION_EMOJIS: &str = "description_emojis";
    /// Per-language post count
    pub const LANGUAGES: &str = "languages";
}

/// Pending counter increments keyed by (name, member)
#[derive(Debug, Default)]
struct CounterDeltas(BTreeMap<(&'static str, String), i64>);

impl CounterDeltas {
    fn total(&mut self, name: &'static str, n: i64) {
        self.member(name, "", n);
    }

    fn member(&mut self, name: &'static str, member: &str, n: i64) {
        if n != 0 {
            *self.0.entry((name, member.to_string())).or_default() += n;
        }
    }

    fn flag(&mut self, set: bool, with: &'static str, without: &'static str) {
        self.total(if set { with } else { without }, 1);
    }
}

/// Writes advisory counters to the state database
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    db: Database,
}

impl StatsAggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records counters for posts that were just stored
    pub async fn record_posts(&self, posts: &[PostRecord]) {
        if posts.is_empty() {
            return;
        }

        let mut deltas = CounterDeltas::default();
        deltas.total(counters::PROCESSED_POSTS, posts.len() as i64);
        for post in posts {
            deltas.flag(
                post.has_emojis,
                counters::POSTS_WITH_EMOJIS,
                counters::POSTS_WITHOUT_EMOJIS,
            );
            deltas.total(counters::PROCESSED_EMOJIS, post.emojis.len() as i64);
            for emoji in &post.emojis {
                deltas.member(counters::POST_EMOJIS, emoji, 1);
            }
            for lang in &post.languages {
                deltas.member(counters::LANGUAGES, lang, 1);
            }
        }

        self.apply(deltas).await;
    }

    /// Records counters for profiles that were just stored
    pub async fn record_profiles(&self, profiles: &[ProfileRecord]) {
        if profiles.is_empty() {
            return;
        }

        let mut deltas = CounterDeltas::default();
        deltas.total(counters::PROCESSED_PROFILES, profiles.len() as i64);
        for profile in profiles {
            deltas.flag(
                profile.has_display_name_emojis,
                counters::DISPLAY_NAMES_WITH_EMOJIS,
                counters::DISPLAY_NAMES_WITHOUT_EMOJIS,
            );
            deltas.flag(
                profile.has_description_emojis,
                counters::DESCRIPTIONS_WITH_EMOJIS,
                counters::DESCRIPTIONS_WITHOUT_EMOJIS,
            );
            for emoji in &profile.display_name_emojis {
                deltas.member(counters::DISPLAY_NAME_EMOJIS, emoji, 1);
            }
            for emoji in &profile.description_emojis {
                deltas.member(counters::DESCRIPTION_EMOJIS, emoji, 1);
            }
        }

        self.apply(deltas).await;
    }

    async fn apply(&self, deltas: CounterDeltas) {
        let updates = deltas.0.len();
        match self.db.call(move |conn| upsert_counters(conn, &deltas)).await {
            Ok(()) => tracing::trace!("Updated {} counters", updates),
            Err(e) => tracing::warn!("Failed to update stats counters: {}", e),
        }
    }
}

fn upsert_counters(conn: &mut Connection, deltas: &CounterDeltas) -> StorageResult<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO stats_counters (name, member, count) VALUES (?1, ?2, ?3)
             ON CONFLICT(name, member) DO UPDATE SET count = count + excluded.count",
        )?;
        for ((name, member), count) in &deltas.0 {
            stmt.execute(params![name, member, count])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Reads a plain total counter
pub fn read_total(conn: &Connection, name: &str) -> StorageResult<i64> {
    let count = conn.query_row(
        "SELECT COALESCE(SUM(count), 0) FROM stats_counters WHERE name = ?1 AND member = ''",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Reads the highest-count members of a keyed counter
pub fn top_members(
    conn: &Connection,
    name: &str,
    limit: usize,
) -> StorageResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT member, count FROM stats_counters WHERE name = ?1 AND member != ''
         ORDER BY count DESC, member ASC LIMIT ?2",
    )?;
    let rows: Vec<(String, i64)> = stmt
        .query_map(params![name, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Summary of stored harvest data
#[derive(Debug, Clone, Default)]
pub struct HarvestStatistics {
    /// Plain totals, in display order
    pub totals: Vec<(&'static str, i64)>,

    /// Top members of each keyed counter
    pub top: Vec<(&'static str, Vec<(String, i64)>)>,

    /// Identities per status
    pub identities: Vec<(IdentityStatus, i64)>,

    /// Rows per output table
    pub output_rows: Vec<(&'static str, i64)>,
}

const TOTALS: [&str; 9] = [
    counters::PROCESSED_POSTS,
    counters::POSTS_WITH_EMOJIS,
    counters::POSTS_WITHOUT_EMOJIS,
    counters::PROCESSED_EMOJIS,
    counters::PROCESSED_PROFILES,
    counters::DISPLAY_NAMES_WITH_EMOJIS,
    counters::DISPLAY_NAMES_WITHOUT_EMOJIS,
    counters::DESCRIPTIONS_WITH_EMOJIS,
    counters::DESCRIPTIONS_WITHOUT_EMOJIS,
];

const KEYED: [&str; 4] = [
    counters::POST_EMOJIS,
    counters::LANGUAGES,
    counters::DISPLAY_NAME_EMOJIS,
    counters::DESCRIPTION_EMOJIS,
];

/// Loads statistics from the state and output databases
///
/// # Arguments
///
/// * `state` - Database holding counters and identity statuses
/// * `output` - Database holding harvested records
/// * `top` - How many members of each keyed counter to include
pub async fn load_statistics(
    state: &Database,
    output: &Database,
    top: usize,
) -> StorageResult<HarvestStatistics> {
    let (totals, top, identities) = state
        .call(move |conn| {
            let mut totals = Vec::with_capacity(TOTALS.len());
            for name in TOTALS {
                totals.push((name, read_total(conn, name)?));
            }

            let mut keyed = Vec::with_capacity(KEYED.len());
            for name in KEYED {
                keyed.push((name, top_members(conn, name, top)?));
            }

            Ok((totals, keyed, count_statuses(conn)?))
        })
        .await?;

    let output_rows = output.call(|conn| count_output_rows(conn)).await?;

    Ok(HarvestStatistics {
        totals,
        top,
        identities,
        output_rows,
    })
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &HarvestStatistics) {
    println!("=== Harvest Statistics ===\n");

    println!("Identities:");
    let known: i64 = stats.identities.iter().map(|(_, c)| c).sum();
    for (status, count) in &stats.identities {
        let percentage = if known > 0 {
            (*count as f64 / known as f64) * 100.0
        } else {
            0.0
        };
        println!("  {}: {} ({:.1}%)", status, count, percentage);
    }
    println!();

    println!("Stored rows:");
    for (table, count) in &stats.output_rows {
        println!("  {}: {}", table, count);
    }
    println!();

    println!("Counters:");
    for (name, count) in &stats.totals {
        println!("  {}: {}", name, count);
    }
    println!();

    for (name, members) in &stats.top {
        if members.is_empty() {
            continue;
        }
        println!("Top {}:", name);
        for (member, count) in members {
            println!("  {}: {}", member, count);
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SchemaKind;

    fn post(emojis: &[&str], langs: &[&str]) -> PostRecord {
        PostRecord {
            content_hash: "c".to_string(),
            identity: "did:plc:a".to_string(),
            record_key: "r".to_string(),
            has_emojis: !emojis.is_empty(),
            languages: langs.iter().map(|s| s.to_string()).collect(),
            emojis: emojis.iter().map(|s| s.to_string()).collect(),
            text: String::new(),
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
        }
    }

    async fn totals(db: &Database, name: &'static str) -> i64 {
        db.call(move |conn| read_total(conn, name)).await.unwrap()
    }

    #[tokio::test]
    async fn test_record_posts() {
        let db = Database::open_in_memory(SchemaKind::State).unwrap();
        let stats = StatsAggregator::new(db.clone());

        stats
            .record_posts(&[
                post(&["1f600", "1f389"], &["en"]),
                post(&["1f600"], &["en", "ja"]),
                post(&[], &["unknown"]),
            ])
            .await;
        stats.record_posts(&[post(&["1f600"], &["en"])]).await;

        assert_eq!(totals(&db, counters::PROCESSED_POSTS).await, 4);
        assert_eq!(totals(&db, counters::POSTS_WITH_EMOJIS).await, 3);
        assert_eq!(totals(&db, counters::POSTS_WITHOUT_EMOJIS).await, 1);
        assert_eq!(totals(&db, counters::PROCESSED_EMOJIS).await, 4);

        let top = db
            .call(|conn| top_members(conn, counters::POST_EMOJIS, 10))
            .await
            .unwrap();
        assert_eq!(
            top,
            vec![("1f600".to_string(), 3), ("1f389".to_string(), 1)]
        );

        let langs = db
            .call(|conn| top_members(conn, counters::LANGUAGES, 1))
            .await
            .unwrap();
        assert_eq!(langs, vec![("en".to_string(), 3)]);
    }

    #[tokio::test]
    async fn test_record_profiles() {
        let db = Database::open_in_memory(SchemaKind::State).unwrap();
        let stats = StatsAggregator::new(db.clone());

        let profile = ProfileRecord {
            content_hash: "c".to_string(),
            identity: "did:plc:a".to_string(),
            record_key: "self".to_string(),
            display_name: "n".to_string(),
            description: String::new(),
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            has_display_name_emojis: true,
            has_description_emojis: false,
            display_name_emojis: vec!["1f338".to_string()],
            description_emojis: vec![],
        };
        stats.record_profiles(&[profile]).await;

        assert_eq!(totals(&db, counters::PROCESSED_PROFILES).await, 1);
        assert_eq!(totals(&db, counters::DISPLAY_NAMES_WITH_EMOJIS).await, 1);
        assert_eq!(totals(&db, counters::DESCRIPTIONS_WITHOUT_EMOJIS).await, 1);
        assert_eq!(totals(&db, counters::DESCRIPTIONS_WITH_EMOJIS).await, 0);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        // Output schema has no counter table
        let db = Database::open_in_memory(SchemaKind::Output).unwrap();
        let stats = StatsAggregator::new(db);
        stats.record_posts(&[post(&["1f600"], &["en"])]).await;
    }

    #[tokio::test]
    async fn test_load_statistics() {
        let state = Database::open_in_memory(SchemaKind::State).unwrap();
        let output = Database::open_in_memory(SchemaKind::Output).unwrap();
        StatsAggregator::new(state.clone())
            .record_posts(&[post(&["1f600"], &["en"])])
            .await;

        let stats = load_statistics(&state, &output, 5).await.unwrap();
        assert_eq!(stats.totals.len(), TOTALS.len());
        assert_eq!(stats.totals[0], (counters::PROCESSED_POSTS, 1));
        assert_eq!(stats.top.len(), KEYED.len());
        assert!(stats.identities.is_empty());
        assert!(stats.output_rows.iter().all(|(_, c)| *c == 0));

        print_statistics(&stats);
    }
}
