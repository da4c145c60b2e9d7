/// Identity status definitions for tracking harvest progress
///
/// A status is kept per identity across runs so interrupted harvests resume
/// where they stopped.
use std::fmt;

/// Current status of an identity in the harvest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdentityStatus {
    // ===== Active States =====
    /// Never attempted (also used for absent or unreadable entries)
    #[default]
    Pending,

    /// A fetch is in progress, or a previous run stopped mid-fetch
    Processing,

    /// Something went wrong after the stream started; attempt again
    Retry,

    // ===== Terminal States =====
    /// The whole repository stream was consumed
    Completed,

    /// The fetch itself failed; never attempted again
    Failed,
}

impl IdentityStatus {
    /// Returns true if this identity needs no further work
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if this status is left over from an earlier attempt
    pub fn is_reattempt(&self) -> bool {
        matches!(self, Self::Processing | Self::Retry)
    }

    /// Converts the status to its stored string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "retry" => Some(Self::Retry),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Reads a stored status, treating anything unknown as Pending
    pub fn from_stored(stored: Option<&str>) -> Self {
        stored.and_then(Self::from_db_string).unwrap_or_default()
    }

    pub fn all_statuses() -> Vec<Self> {
        vec![
            Self::Pending,
            Self::Processing,
            Self::Retry,
            Self::Completed,
            Self::Failed,
        ]
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
