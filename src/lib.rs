//! Skyharvest: a resumable repository harvester for the AT Protocol network
//!
//! This crate enumerates identities and their hosting servers from a directory
//! snapshot, keeps only identities on reachable hosts, streams every identity's
//! repository through an external fetch service, normalizes the posts and
//! profiles it finds, and persists them in batches.

pub mod config;
pub mod crawler;
pub mod directory;
pub mod host;
pub mod output;
pub mod records;
pub mod shutdown;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for harvester operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Batch queue error: {0}")]
    Queue(#[from] storage::QueueError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid host in config: {0}")]
    InvalidHost(String),
}

/// Host name errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Host name is empty")]
    Empty,

    #[error("Invalid host name: {0}")]
    InvalidHostname(String),

    #[error("Invalid port in host: {0}")]
    InvalidPort(String),

    #[error("Malformed host: {0}")]
    Malformed(String),
}

/// Result type alias for harvester operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for host operations
pub type HostResult<T> = std::result::Result<T, HostError>;

// Re-export commonly used types
pub use config::Config;
pub use directory::IdentityHostPair;
pub use host::{normalize_host, sanitize_host};
pub use records::{PostRecord, ProfileRecord};
pub use state::IdentityStatus;
