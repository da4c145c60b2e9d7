use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for the harvester
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub directory: DirectoryConfig,
    pub health: HealthConfig,
    pub crawler: CrawlerConfig,
    pub persistence: PersistenceConfig,
}

/// Directory snapshot input configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Path to the SQLite directory mirror (identity -> host)
    #[serde(rename = "plc-db-path")]
    pub plc_db_path: String,

    /// Path of the line-delimited JSON cache of (identity, host) pairs
    #[serde(rename = "pairs-path")]
    pub pairs_path: String,

    /// Host that replaces every host on the default hosting domains
    #[serde(rename = "relay-host")]
    pub relay_host: String,

    /// Substrings identifying the platform's default hosting domains
    #[serde(rename = "default-host-markers", default = "default_host_markers")]
    pub default_host_markers: Vec<String>,
}

/// Host health probing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Path of the JSON health cache (host -> bool)
    #[serde(rename = "cache-path")]
    pub cache_path: String,

    /// Maximum number of concurrent probes
    pub concurrency: u32,

    /// Per-probe timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    /// Retries for throttled or 5xx probe responses
    #[serde(rename = "max-retries", default = "default_probe_retries")]
    pub max_retries: u32,

    /// URL scheme used for probes
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

/// Crawl scheduling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Endpoint of the repository fetch service
    #[serde(rename = "fetch-url")]
    pub fetch_url: String,

    /// Maximum number of identities fetched concurrently
    pub concurrency: u32,

    /// Number of identities scheduled per chunk
    #[serde(rename = "chunk-size", default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Timeout for receiving the fetch service's response headers
    #[serde(rename = "request-timeout-secs")]
    pub request_timeout_secs: u64,

    /// Maximum silence between two reads of a response stream
    #[serde(rename = "stream-idle-timeout-secs", default = "default_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    /// Log a progress line every N completed identities
    #[serde(rename = "progress-every", default = "default_progress_every")]
    pub progress_every: u64,

    /// Optional cap on the number of identities processed in one run
    #[serde(rename = "max-identities", default)]
    pub max_identities: Option<usize>,

    /// Number of extra passes over identities left in Retry
    #[serde(rename = "retry-passes", default = "default_retry_passes")]
    pub retry_passes: u32,

    /// How long in-flight identities may finish after a shutdown request
    #[serde(rename = "shutdown-grace-secs", default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Years before the run year still considered plausible for createdAt
    #[serde(rename = "plausible-years-back", default = "default_years_back")]
    pub plausible_years_back: i32,

    /// Years after the run year still considered plausible for createdAt
    #[serde(rename = "plausible-years-ahead", default = "default_years_ahead")]
    pub plausible_years_ahead: i32,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Path to the SQLite output database
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Path to the SQLite identity state and counter store
    #[serde(rename = "state-path")]
    pub state_path: String,

    /// Number of records per bulk insert
    #[serde(rename = "batch-size")]
    pub batch_size: usize,

    /// Maximum time a record waits in the buffer (milliseconds)
    #[serde(rename = "batch-timeout-ms")]
    pub batch_timeout_ms: u64,

    /// Insert attempts per batch before giving up
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential backoff (milliseconds)
    #[serde(rename = "backoff-base-ms", default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// What to do once a batch exhausted its attempts
    #[serde(rename = "on-exhausted", default)]
    pub on_exhausted: ExhaustedPolicy,
}

/// Policy applied when a batch insert exhausts its attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustedPolicy {
    /// Keep the batch at the front of the buffer and shut the process down
    #[default]
    FailFast,

    /// Keep the batch at the front of the buffer and keep running
    Requeue,
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CrawlerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl PersistenceConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_host_markers() -> Vec<String> {
    vec!["bsky.social".to_string(), "bsky.network".to_string()]
}

fn default_probe_retries() -> u32 {
    3
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_progress_every() -> u64 {
    100
}

fn default_retry_passes() -> u32 {
    1
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_years_back() -> i32 {
    4
}

fn default_years_ahead() -> i32 {
    1
}

fn default_backoff_base() -> u64 {
    1000
}
