//! Emoji extraction and normalization
//!
//! Text is split into extended grapheme clusters; a cluster counts as an emoji
//! when it is a keycap, a flag, an emoji-presentation pictograph, or a text
//! pictograph forced to emoji presentation (variation selector, skin tone
//! modifier, or ZWJ sequence).

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use unicode_segmentation::UnicodeSegmentation;

const TEXT_VARIATION_SELECTOR: char = '\u{FE0E}';
const EMOJI_VARIATION_SELECTOR: char = '\u{FE0F}';

fn emoji_grapheme() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?sx)^(?:
                [0-9\#*]\x{FE0F}?\x{20E3}
              | \p{Regional_Indicator}{2}
              | \p{Emoji_Presentation}[^\x{FE0E}]*
              | \p{Extended_Pictographic}\x{FE0F}.*
              | \p{Extended_Pictographic}[\p{Emoji_Modifier}\x{200D}].*
            )$",
        )
        .expect("emoji grapheme pattern is valid")
    })
}

/// Returns true if a single grapheme cluster is an emoji
pub fn is_emoji_grapheme(grapheme: &str) -> bool {
    emoji_grapheme().is_match(grapheme)
}

/// Normalizes an emoji to its canonical form
///
/// The canonical form is the sequence of lowercase hexadecimal code points
/// (at least four digits each) joined by `-`, with variation selectors removed.
///
/// # Examples
///
/// ```
/// use skyharvest::records::normalize_emoji;
///
/// assert_eq!(normalize_emoji("😀"), "1f600");
/// assert_eq!(normalize_emoji("❤\u{FE0F}"), "2764");
/// assert_eq!(normalize_emoji("🇫🇷"), "1f1eb-1f1f7");
/// ```
pub fn normalize_emoji(emoji: &str) -> String {
    emoji
        .chars()
        .filter(|c| *c != EMOJI_VARIATION_SELECTOR && *c != TEXT_VARIATION_SELECTOR)
        .map(|c| format!("{:04x}", c as u32))
        .collect::<Vec<_>>()
        .join("-")
}

/// Extracts the normalized emoji of a text, in order of first occurrence
///
/// Exact duplicates (after normalization) are removed.
///
/// # Examples
///
/// ```
/// use skyharvest::records::extract_emojis;
///
/// let emojis = extract_emojis("good morning ☕☕ 🌅");
/// assert_eq!(emojis, vec!["2615".to_string(), "1f305".to_string()]);
/// ```
pub fn extract_emojis(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.graphemes(true)
        .filter(|g| is_emoji_grapheme(g))
        .map(normalize_emoji)
        .filter(|normalized| seen.insert(normalized.clone()))
        .collect()
}
