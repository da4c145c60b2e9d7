//! Directory module for enumerating identities
//!
//! This module handles:
//! - Dumping (identity, host) pairs from the SQLite directory mirror
//! - Loading the cached pairs grouped by host
//! - Probing hosts and keeping only identities on healthy ones

mod health;
mod loader;

pub use health::{select_healthy, HealthMap, HostHealthChecker, DESCRIBE_SERVER_PATH};
pub use loader::{dump_directory, load_pairs, DumpOutcome, HostGroups, LATEST_PAIRS_SQL};

use serde::{Deserialize, Serialize};

/// An identity and the host serving its repository
///
/// Serialized as `{"did": ..., "pds": ...}`, both in the pairs cache and in
/// fetch requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityHostPair {
    #[serde(rename = "did")]
    pub identity: String,

    #[serde(rename = "pds")]
    pub host: String,
}

impl IdentityHostPair {
    pub fn new(identity: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            host: host.into(),
        }
    }
}
