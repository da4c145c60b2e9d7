//! createdAt sanitization
//!
//! Record timestamps are user supplied and frequently wrong. Every value is
//! mapped to a valid RFC 3339 UTC timestamp, with flags recording whether the
//! source value looked implausible (`was_weird`) and whether it had to be
//! replaced by the zero epoch (`defaulted`).

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Replacement for missing or unusable timestamps
pub const EPOCH_ZERO: &str = "1970-01-01T00:00:00.000Z";

/// Earliest year representable by the network's reference implementation
pub const LEGAL_LOW_YEAR: i32 = 1;

/// Latest year representable by the network's reference implementation
pub const LEGAL_HIGH_YEAR: i32 = 294_275;

/// Result of sanitizing a timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedTimestamp {
    /// RFC 3339 UTC timestamp with millisecond precision
    pub value: String,

    /// The source value was present but implausible or invalid
    pub was_weird: bool,

    /// The value was replaced by [`EPOCH_ZERO`]
    pub defaulted: bool,
}

impl SanitizedTimestamp {
    fn epoch(was_weird: bool) -> Self {
        Self {
            value: EPOCH_ZERO.to_string(),
            was_weird,
            defaulted: true,
        }
    }

    fn parsed(timestamp: DateTime<Utc>, was_weird: bool) -> Self {
        Self {
            value: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            was_weird,
            defaulted: false,
        }
    }

    /// Returns true if this value deserves an audit log line
    pub fn needs_audit(&self) -> bool {
        self.was_weird || self.defaulted
    }
}

/// Inclusive range of years considered plausible for a record's createdAt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlausibleWindow {
    pub low_year: i32,
    pub high_year: i32,
}

impl PlausibleWindow {
    /// Builds the window around the given run time
    pub fn around(run_time: DateTime<Utc>, years_back: i32, years_ahead: i32) -> Self {
        let year = run_time.year();
        Self {
            low_year: year - years_back,
            high_year: year + years_ahead,
        }
    }

    pub fn contains(&self, year: i32) -> bool {
        year >= self.low_year && year <= self.high_year
    }
}

/// Sanitizes a createdAt value
///
/// # Rules
///
/// 1. Missing or empty → zero epoch, not weird, defaulted
/// 2. A `0000-` prefix is rewritten to `0001-` (there is no year zero)
/// 3. Unparseable → zero epoch, weird, defaulted
/// 4. Year outside the legal range → zero epoch, weird, defaulted
/// 5. Year legal but outside `window` → parsed value, weird
/// 6. Otherwise → parsed value
///
/// # Examples
///
/// ```
/// use skyharvest::records::{sanitize_timestamp, PlausibleWindow, EPOCH_ZERO};
///
/// let window = PlausibleWindow { low_year: 2022, high_year: 2026 };
///
/// let ts = sanitize_timestamp(Some("2024-05-01T12:00:00Z"), &window);
/// assert_eq!(ts.value, "2024-05-01T12:00:00.000Z");
/// assert!(!ts.was_weird);
///
/// let ts = sanitize_timestamp(None, &window);
/// assert_eq!(ts.value, EPOCH_ZERO);
/// assert!(ts.defaulted);
/// ```
pub fn sanitize_timestamp(input: Option<&str>, window: &PlausibleWindow) -> SanitizedTimestamp {
    let raw = match input.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return SanitizedTimestamp::epoch(false),
    };

    let rewritten;
    let candidate = match raw.strip_prefix("0000-") {
        Some(rest) => {
            rewritten = format!("0001-{}", rest);
            rewritten.as_str()
        }
        None => raw,
    };

    let parsed = match parse_timestamp(candidate) {
        Some(parsed) => parsed,
        None => return SanitizedTimestamp::epoch(true),
    };

    let year = parsed.year();
    if !(LEGAL_LOW_YEAR..=LEGAL_HIGH_YEAR).contains(&year) {
        return SanitizedTimestamp::epoch(true);
    }

    SanitizedTimestamp::parsed(parsed, !window.contains(year))
}

/// Parses the timestamp shapes seen in records
///
/// RFC 3339 first; values without an offset are read as UTC. Years past
/// 9999 only parse in the signed form (`+10000-…Z`) that formatting produces.
fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in [
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> PlausibleWindow {
        PlausibleWindow {
            low_year: 2022,
            high_year: 2026,
        }
    }

    #[test]
    fn test_empty_is_defaulted_not_weird() {
        let expected = SanitizedTimestamp {
            value: EPOCH_ZERO.to_string(),
            was_weird: false,
            defaulted: true,
        };
        assert_eq!(sanitize_timestamp(Some(""), &window()), expected);
        assert_eq!(sanitize_timestamp(Some("   "), &window()), expected);
        assert_eq!(sanitize_timestamp(None, &window()), expected);
    }

    #[test]
    fn test_plausible_timestamp() {
        let ts = sanitize_timestamp(Some("2023-11-05T08:30:15.123Z"), &window());
        assert_eq!(ts.value, "2023-11-05T08:30:15.123Z");
        assert!(!ts.was_weird);
        assert!(!ts.defaulted);
    }

    #[test]
    fn test_offset_converted_to_utc() {
        let ts = sanitize_timestamp(Some("2024-01-01T01:00:00+02:00"), &window());
        assert_eq!(ts.value, "2023-12-31T23:00:00.000Z");
    }

    #[test]
    fn test_missing_offset_read_as_utc() {
        let ts = sanitize_timestamp(Some("2024-02-03T04:05:06"), &window());
        assert_eq!(ts.value, "2024-02-03T04:05:06.000Z");

        let ts = sanitize_timestamp(Some("2024-02-03"), &window());
        assert_eq!(ts.value, "2024-02-03T00:00:00.000Z");
    }

    #[test]
    fn test_year_zero_rewritten_to_year_one() {
        let ts = sanitize_timestamp(Some("0000-01-01T00:00:00Z"), &window());
        assert_eq!(ts.value, "0001-01-01T00:00:00.000Z");
        assert!(ts.was_weird);
        assert!(!ts.defaulted);
    }

    #[test]
    fn test_unparseable_is_defaulted_and_weird() {
        let ts = sanitize_timestamp(Some("yesterday-ish"), &window());
        assert_eq!(ts.value, EPOCH_ZERO);
        assert!(ts.was_weird);
        assert!(ts.defaulted);
    }

    #[test]
    fn test_implausible_year_keeps_value() {
        let ts = sanitize_timestamp(Some("1999-12-31T23:59:59Z"), &window());
        assert_eq!(ts.value, "1999-12-31T23:59:59.000Z");
        assert!(ts.was_weird);
        assert!(!ts.defaulted);

        let ts = sanitize_timestamp(Some("2099-01-01T00:00:00Z"), &window());
        assert!(ts.was_weird);
        assert!(!ts.defaulted);
    }

    #[test]
    fn test_offset_pushing_into_year_zero_is_defaulted() {
        let ts = sanitize_timestamp(Some("0001-01-01T00:00:00+01:00"), &window());
        assert_eq!(ts.value, EPOCH_ZERO);
        assert!(ts.was_weird);
        assert!(ts.defaulted);
    }

    #[test]
    fn test_offset_pushing_past_year_9999_round_trips() {
        let first = sanitize_timestamp(Some("9999-12-31T23:30:00-01:00"), &window());
        assert_eq!(first.value, "+10000-01-01T00:30:00.000Z");
        assert!(first.was_weird);
        assert!(!first.defaulted);

        let second = sanitize_timestamp(Some(&first.value), &window());
        assert_eq!(second, first);
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            "",
            "garbage",
            "0000-06-15T10:00:00Z",
            "1970-01-01T00:00:00.000Z",
            "2024-07-04T12:34:56.789123Z",
            "2024-07-04T12:34:56+05:30",
            "9999-12-31T23:59:59Z",
            "9999-12-31T23:30:00-01:00",
            "0001-01-01T00:00:00+01:00",
            "2024-02-30T00:00:00Z",
            "12345-01-01T00:00:00Z",
        ];

        for input in inputs {
            let first = sanitize_timestamp(Some(input), &window());
            let second = sanitize_timestamp(Some(&first.value), &window());
            assert_eq!(second.value, first.value, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn test_window_around_run_time() {
        let run_time = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        let window = PlausibleWindow::around(run_time, 4, 1);
        assert_eq!(window.low_year, 2022);
        assert_eq!(window.high_year, 2027);
        assert!(window.contains(2022));
        assert!(window.contains(2027));
        assert!(!window.contains(2021));
        assert!(!window.contains(2028));
    }

    #[test]
    fn test_needs_audit() {
        assert!(!sanitize_timestamp(Some("2024-01-01T00:00:00Z"), &window()).needs_audit());
        assert!(sanitize_timestamp(None, &window()).needs_audit());
        assert!(sanitize_timestamp(Some("1990-01-01T00:00:00Z"), &window()).needs_audit());
    }
}
