//! Database schema definitions
//!
//! Two databases are used: the output database holding harvested records,
//! and the state database holding identity statuses and advisory counters.

/// SQL schema for the output database
pub const OUTPUT_SCHEMA_SQL: &str = r#"
-- Harvested posts
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cid TEXT NOT NULL,
    did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    has_emojis INTEGER NOT NULL DEFAULT 0,
    langs TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(did, cid, rkey)
);

CREATE INDEX IF NOT EXISTS idx_posts_did ON posts(did);
CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at);

-- One row per emoji per declared language of a post
CREATE TABLE IF NOT EXISTS post_emojis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL REFERENCES posts(id),
    emoji TEXT NOT NULL,
    lang TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_post_emojis_post ON post_emojis(post_id);
CREATE INDEX IF NOT EXISTS idx_post_emojis_emoji ON post_emojis(emoji);

-- Harvested profiles
CREATE TABLE IF NOT EXISTS profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cid TEXT NOT NULL,
    did TEXT NOT NULL,
    rkey TEXT NOT NULL,
    display_name TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    has_display_name_emojis INTEGER NOT NULL DEFAULT 0,
    has_description_emojis INTEGER NOT NULL DEFAULT 0,
    UNIQUE(did, cid, rkey)
);

CREATE INDEX IF NOT EXISTS idx_profiles_did ON profiles(did);

CREATE TABLE IF NOT EXISTS profile_display_name_emojis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id INTEGER NOT NULL REFERENCES profiles(id),
    emoji TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_profile_dn_emojis_profile ON profile_display_name_emojis(profile_id);

CREATE TABLE IF NOT EXISTS profile_description_emojis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    profile_id INTEGER NOT NULL REFERENCES profiles(id),
    emoji TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_profile_desc_emojis_profile ON profile_description_emojis(profile_id);
"#;

/// SQL schema for the state database
pub const STATE_SCHEMA_SQL: &str = r#"
-- Per-identity harvest status, kept across runs
CREATE TABLE IF NOT EXISTS identity_status (
    identity TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_identity_status_status ON identity_status(status);

-- Advisory counters; plain totals use an empty member
CREATE TABLE IF NOT EXISTS stats_counters (
    name TEXT NOT NULL,
    member TEXT NOT NULL DEFAULT '',
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (name, member)
);
"#;

/// Tables of the output database, in display order
pub const OUTPUT_TABLES: [&str; 5] = [
    "posts",
    "post_emojis",
    "profiles",
    "profile_display_name_emojis",
    "profile_description_emojis",
];

/// Which database a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Output,
    State,
}

impl SchemaKind {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Output => OUTPUT_SCHEMA_SQL,
            Self::State => STATE_SCHEMA_SQL,
        }
    }
}

/// Initializes the schema of the given kind
pub fn initialize_schema(
    conn: &rusqlite::Connection,
    kind: SchemaKind,
) -> Result<(), rusqlite::Error> {
    conn.execute_batch(kind.sql())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn test_schemas_are_idempotent() {
        for kind in [SchemaKind::Output, SchemaKind::State] {
            let conn = Connection::open_in_memory().unwrap();
            initialize_schema(&conn, kind).unwrap();
            assert!(initialize_schema(&conn, kind).is_ok());
        }
    }

    #[test]
    fn test_output_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, SchemaKind::Output).unwrap();

        for table in OUTPUT_TABLES {
            assert!(table_exists(&conn, table), "Table {} should exist", table);
        }
    }

    #[test]
    fn test_state_tables_exist_after_init() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn, SchemaKind::State).unwrap();

        assert!(table_exists(&conn, "identity_status"));
        assert!(table_exists(&conn, "stats_counters"));
        assert!(!table_exists(&conn, "posts"));
    }
}
