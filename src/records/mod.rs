//! Repository record model
//!
//! Stream entries are classified as posts, profiles or unknown, then
//! normalized: text is sanitized, emoji extracted and timestamps repaired.

mod classify;
mod emoji;
mod sanitize;
mod timestamp;

pub use classify::{
    classify_entry, classify_key, normalize_languages, ClassifiedRecord, NormalizedRecord,
    Normalizer, PostPayload, ProfilePayload, RawEntry, RecordKind, UNKNOWN_LANGUAGE,
};
pub use emoji::{extract_emojis, is_emoji_grapheme, normalize_emoji};
pub use sanitize::{random_record_key, record_key_from, sanitize_optional, sanitize_text};
pub use timestamp::{
    sanitize_timestamp, PlausibleWindow, SanitizedTimestamp, EPOCH_ZERO, LEGAL_HIGH_YEAR,
    LEGAL_LOW_YEAR,
};

/// Collection holding an identity's posts
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Collection holding an identity's profile
pub const PROFILE_COLLECTION: &str = "app.bsky.actor.profile";

/// A normalized post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRecord {
    /// Content hash (CID) of the record
    pub content_hash: String,

    /// Identity (DID) owning the repository
    pub identity: String,

    /// Record key within the collection
    pub record_key: String,

    pub has_emojis: bool,

    /// Declared languages, `["unknown"]` when none
    pub languages: Vec<String>,

    /// Distinct normalized emoji, in order of first occurrence
    pub emojis: Vec<String>,

    pub text: String,

    /// RFC 3339 UTC creation time
    pub created_at: String,
}

/// A normalized profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub content_hash: String,
    pub identity: String,
    pub record_key: String,
    pub display_name: String,
    pub description: String,
    pub created_at: String,
    pub has_display_name_emojis: bool,
    pub has_description_emojis: bool,
    pub display_name_emojis: Vec<String>,
    pub description_emojis: Vec<String>,
}

impl PostRecord {
    /// Natural key used to match inserted rows back to their record
    pub fn natural_key(&self) -> (&str, &str, &str) {
        (&self.identity, &self.content_hash, &self.record_key)
    }
}

impl ProfileRecord {
    pub fn natural_key(&self) -> (&str, &str, &str) {
        (&self.identity, &self.content_hash, &self.record_key)
    }
}
