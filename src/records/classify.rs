//! Record classification and normalization
//!
//! Each line of a repository stream is a JSON object mapping
//! `<collection>/<rkey>` to `{ "cid": ..., "value": {...} }`. Entries are
//! classified into a closed set of kinds and normalized into the rows that
//! get persisted.

use crate::records::emoji::extract_emojis;
use crate::records::sanitize::{record_key_from, sanitize_optional, sanitize_text};
use crate::records::timestamp::{sanitize_timestamp, PlausibleWindow, SanitizedTimestamp};
use crate::records::{PostRecord, ProfileRecord, POST_COLLECTION, PROFILE_COLLECTION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Language used when a post declares none
pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// One entry of a stream line, before classification
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntry {
    /// Content hash of the record
    #[serde(default, alias = "contentHash")]
    pub cid: Option<String>,

    /// Record payload
    #[serde(default)]
    pub value: Value,
}

/// Fields read from a post payload
///
/// Each field decodes on its own; a field of the wrong type reads as absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub text: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub langs: Option<Vec<Value>>,

    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub cid: Option<String>,
}

/// Fields read from a profile payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePayload {
    #[serde(default, deserialize_with = "lenient")]
    pub display_name: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub description: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<String>,

    #[serde(default, deserialize_with = "lenient")]
    pub cid: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    match T::deserialize(&value) {
        Ok(field) => Ok(Some(field)),
        Err(e) => {
            tracing::debug!("Ignoring payload field {}: {}", value, e);
            Ok(None)
        }
    }
}

/// Kind of a stream entry, decided from its key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Post,
    Profile,
    Unknown,
}

/// A classified stream entry
#[derive(Debug, Clone)]
pub enum ClassifiedRecord {
    Post(PostPayload),
    Profile(ProfilePayload),
    Unknown,
}

/// A normalized record ready to be persisted
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecord {
    Post(PostRecord),
    Profile(ProfileRecord),
}

/// Classifies an entry key
///
/// The collection part of the key (everything before the final `/`) is
/// matched against the known collection names.
///
/// # Examples
///
/// ```
/// use skyharvest::records::{classify_key, RecordKind};
///
/// assert_eq!(classify_key("app.bsky.feed.post/3k2a"), RecordKind::Post);
/// assert_eq!(classify_key("app.bsky.actor.profile/self"), RecordKind::Profile);
/// assert_eq!(classify_key("app.bsky.feed.like/3k2b"), RecordKind::Unknown);
/// ```
pub fn classify_key(key: &str) -> RecordKind {
    let collection = key.rsplit_once('/').map(|(c, _)| c).unwrap_or(key);

    if collection.contains(POST_COLLECTION) {
        RecordKind::Post
    } else if collection.contains(PROFILE_COLLECTION) {
        RecordKind::Profile
    } else {
        RecordKind::Unknown
    }
}

/// Classifies an entry and decodes its payload
///
/// A payload that is not an object decodes to an empty payload; inside an
/// object, only fields of the wrong type fall back to their defaults.
pub fn classify_entry(key: &str, entry: &RawEntry) -> ClassifiedRecord {
    match classify_key(key) {
        RecordKind::Post => ClassifiedRecord::Post(decode_payload(key, &entry.value)),
        RecordKind::Profile => ClassifiedRecord::Profile(decode_payload(key, &entry.value)),
        RecordKind::Unknown => ClassifiedRecord::Unknown,
    }
}

fn decode_payload<T: Default + for<'de> Deserialize<'de>>(key: &str, value: &Value) -> T {
    match T::deserialize(value) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("Malformed payload for {}: {}", key, e);
            T::default()
        }
    }
}

/// Turns classified entries into persisted rows
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    window: PlausibleWindow,
}

impl Normalizer {
    pub fn new(window: PlausibleWindow) -> Self {
        Self { window }
    }

    pub fn window(&self) -> PlausibleWindow {
        self.window
    }

    /// Normalizes every known entry of a decoded stream line
    ///
    /// Entries that are not objects of the expected shape or belong to an
    /// unknown collection are skipped.
    pub fn normalize_line(&self, identity: &str, line: Map<String, Value>) -> Vec<NormalizedRecord> {
        let mut records = Vec::new();

        for (key, value) in line {
            let entry = match RawEntry::deserialize(&value) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping malformed entry {} for {}: {}", key, identity, e);
                    continue;
                }
            };

            match self.normalize_entry(identity, &key, &entry) {
                Some(record) => records.push(record),
                None => tracing::trace!("Ignoring {} for {}", key, identity),
            }
        }

        records
    }

    /// Normalizes one entry, returning None for unknown collections
    pub fn normalize_entry(
        &self,
        identity: &str,
        key: &str,
        entry: &RawEntry,
    ) -> Option<NormalizedRecord> {
        match classify_entry(key, entry) {
            ClassifiedRecord::Post(payload) => Some(NormalizedRecord::Post(
                self.normalize_post(identity, key, entry, payload),
            )),
            ClassifiedRecord::Profile(payload) => Some(NormalizedRecord::Profile(
                self.normalize_profile(identity, key, entry, payload),
            )),
            ClassifiedRecord::Unknown => None,
        }
    }

    fn normalize_post(
        &self,
        identity: &str,
        key: &str,
        entry: &RawEntry,
        payload: PostPayload,
    ) -> PostRecord {
        let record_key = record_key_from(key);
        let content_hash = content_hash(entry.cid.as_deref(), payload.cid.as_deref());
        let text = sanitize_optional(payload.text.as_deref());
        let emojis = extract_emojis(&text);
        let created_at = sanitize_timestamp(payload.created_at.as_deref(), &self.window);
        audit_timestamp(identity, &record_key, &content_hash, payload.created_at.as_deref(), &created_at);

        PostRecord {
            content_hash,
            identity: identity.to_string(),
            record_key,
            has_emojis: !emojis.is_empty(),
            languages: normalize_languages(payload.langs.as_deref()),
            emojis,
            text,
            created_at: created_at.value,
        }
    }

    fn normalize_profile(
        &self,
        identity: &str,
        key: &str,
        entry: &RawEntry,
        payload: ProfilePayload,
    ) -> ProfileRecord {
        let record_key = record_key_from(key);
        let content_hash = content_hash(entry.cid.as_deref(), payload.cid.as_deref());
        let display_name = sanitize_optional(payload.display_name.as_deref());
        let description = sanitize_optional(payload.description.as_deref());
        let display_name_emojis = extract_emojis(&display_name);
        let description_emojis = extract_emojis(&description);
        let created_at = sanitize_timestamp(payload.created_at.as_deref(), &self.window);
        audit_timestamp(identity, &record_key, &content_hash, payload.created_at.as_deref(), &created_at);

        ProfileRecord {
            content_hash,
            identity: identity.to_string(),
            record_key,
            display_name,
            description,
            created_at: created_at.value,
            has_display_name_emojis: !display_name_emojis.is_empty(),
            has_description_emojis: !description_emojis.is_empty(),
            display_name_emojis,
            description_emojis,
        }
    }
}

/// Picks the entry's content hash, falling back to one embedded in the payload
fn content_hash(entry_cid: Option<&str>, payload_cid: Option<&str>) -> String {
    entry_cid
        .or(payload_cid)
        .map(sanitize_text)
        .unwrap_or_default()
}

/// Sanitizes declared languages, dropping duplicates and non-strings
///
/// Returns `["unknown"]` when nothing usable is declared.
pub fn normalize_languages(langs: Option<&[Value]>) -> Vec<String> {
    let mut languages: Vec<String> = Vec::new();

    for lang in langs.unwrap_or_default() {
        if let Some(lang) = lang.as_str() {
            let lang = sanitize_text(lang);
            if !lang.is_empty() && !languages.contains(&lang) {
                languages.push(lang);
            }
        }
    }

    if languages.is_empty() {
        languages.push(UNKNOWN_LANGUAGE.to_string());
    }

    languages
}

fn audit_timestamp(
    identity: &str,
    record_key: &str,
    content_hash: &str,
    original: Option<&str>,
    sanitized: &SanitizedTimestamp,
) {
    if sanitized.was_weird {
        tracing::warn!(
            identity,
            record_key,
            content_hash,
            original = original.unwrap_or_default(),
            sanitized = %sanitized.value,
            defaulted = sanitized.defaulted,
            "Weird createdAt timestamp"
        );
    } else if sanitized.defaulted {
        tracing::debug!(
            identity,
            record_key,
            content_hash,
            sanitized = %sanitized.value,
            "Missing createdAt timestamp"
        );
    }
}
