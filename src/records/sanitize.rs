//! Free-text and record key sanitization

use rand::{distr::Alphanumeric, Rng};

/// Length of generated record keys, matching the length of a timestamp key
const RANDOM_KEY_LEN: usize = 13;

/// Returns true for the control characters removed from free text
///
/// Tab, line feed and carriage return are kept; every other C0 control
/// character and DEL are removed.
fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}')
}

/// Strips control characters and trims surrounding whitespace
///
/// # Examples
///
/// ```
/// use skyharvest::records::sanitize_text;
///
/// assert_eq!(sanitize_text("  hello\u{0}world \n"), "helloworld");
/// assert_eq!(sanitize_text("line one\nline two"), "line one\nline two");
/// ```
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| !is_stripped_control(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Sanitizes an optional field, mapping a missing value to the empty string
pub fn sanitize_optional(input: Option<&str>) -> String {
    input.map(sanitize_text).unwrap_or_default()
}

/// Derives the record key from a `<collection>/<rkey>` entry key
///
/// The final path segment is taken and sanitized. Record keys are never
/// empty: when nothing usable remains, a random key is generated.
pub fn record_key_from(key: &str) -> String {
    let segment = key.rsplit('/').next().unwrap_or(key);
    let cleaned: String = sanitize_text(segment)
        .chars()
        .filter(|c| !c.is_control())
        .collect();

    if cleaned.is_empty() {
        random_record_key()
    } else {
        cleaned
    }
}

/// Generates a random lowercase alphanumeric record key
pub fn random_record_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_KEY_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_controls() {
        assert_eq!(sanitize_text("a\u{1}b\u{7F}c"), "abc");
        assert_eq!(sanitize_text("\u{0B}\u{0C}x"), "x");
    }

    #[test]
    fn test_sanitize_keeps_whitespace_controls_inside() {
        assert_eq!(sanitize_text("a\tb\r\nc"), "a\tb\r\nc");
    }

    #[test]
    fn test_sanitize_trims() {
        assert_eq!(sanitize_text("   padded   "), "padded");
        assert_eq!(sanitize_text(""), "");
    }

    #[test]
    fn test_sanitize_optional() {
        assert_eq!(sanitize_optional(None), "");
        assert_eq!(sanitize_optional(Some(" x ")), "x");
    }

    #[test]
    fn test_record_key_takes_final_segment() {
        assert_eq!(record_key_from("app.bsky.feed.post/3jzfcijpj2z2a"), "3jzfcijpj2z2a");
        assert_eq!(record_key_from("a/b/c"), "c");
        assert_eq!(record_key_from("self"), "self");
    }

    #[test]
    fn test_record_key_strips_controls() {
        assert_eq!(record_key_from("app.bsky.feed.post/ab\u{0}c\n"), "abc");
    }

    #[test]
    fn test_empty_record_key_gets_random_token() {
        let key = record_key_from("app.bsky.feed.post/");
        assert_eq!(key.len(), RANDOM_KEY_LEN);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));

        let other = record_key_from("app.bsky.feed.post/\u{1}\u{2}");
        assert_eq!(other.len(), RANDOM_KEY_LEN);
    }
}
