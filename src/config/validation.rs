use crate::config::types::{
    Config, CrawlerConfig, DirectoryConfig, HealthConfig, PersistenceConfig,
};
use crate::host::sanitize_host;
use crate::ConfigError;
use url::Url;

/// Upper bound on insert attempts; keeps the backoff exponent small
const MAX_INSERT_ATTEMPTS: u32 = 16;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_directory_config(&config.directory)?;
    validate_health_config(&config.health)?;
    validate_crawler_config(&config.crawler)?;
    validate_persistence_config(&config.persistence)?;
    Ok(())
}

/// Validates directory configuration
fn validate_directory_config(config: &DirectoryConfig) -> Result<(), ConfigError> {
    require_path("plc_db_path", &config.plc_db_path)?;
    require_path("pairs_path", &config.pairs_path)?;

    sanitize_host(&config.relay_host).map_err(|e| {
        ConfigError::InvalidHost(format!("Invalid relay_host '{}': {}", config.relay_host, e))
    })?;

    if config.default_host_markers.iter().any(|m| m.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "default_host_markers cannot contain empty entries".to_string(),
        ));
    }

    Ok(())
}

/// Validates host health configuration
fn validate_health_config(config: &HealthConfig) -> Result<(), ConfigError> {
    require_path("cache_path", &config.cache_path)?;

    if config.concurrency < 1 || config.concurrency > 1000 {
        return Err(ConfigError::Validation(format!(
            "health concurrency must be between 1 and 1000, got {}",
            config.concurrency
        )));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "health timeout_secs must be > 0".to_string(),
        ));
    }

    if config.scheme != "https" && config.scheme != "http" {
        return Err(ConfigError::Validation(format!(
            "health scheme must be 'http' or 'https', got '{}'",
            config.scheme
        )));
    }

    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.fetch_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid fetch_url: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "fetch_url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.concurrency < 1 || config.concurrency > 10_000 {
        return Err(ConfigError::Validation(format!(
            "crawler concurrency must be between 1 and 10000, got {}",
            config.concurrency
        )));
    }

    if config.chunk_size < 1 {
        return Err(ConfigError::Validation(
            "chunk_size must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs == 0 || config.stream_idle_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request and stream idle timeouts must be > 0".to_string(),
        ));
    }

    if config.progress_every == 0 {
        return Err(ConfigError::Validation(
            "progress_every must be >= 1".to_string(),
        ));
    }

    if config.plausible_years_back < 0 || config.plausible_years_ahead < 0 {
        return Err(ConfigError::Validation(format!(
            "plausible year window cannot be negative, got -{} / +{}",
            config.plausible_years_back, config.plausible_years_ahead
        )));
    }

    Ok(())
}

/// Validates persistence configuration
fn validate_persistence_config(config: &PersistenceConfig) -> Result<(), ConfigError> {
    require_path("database_path", &config.database_path)?;
    require_path("state_path", &config.state_path)?;

    if config.batch_size < 1 {
        return Err(ConfigError::Validation(format!(
            "batch_size must be >= 1, got {}",
            config.batch_size
        )));
    }

    if config.batch_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "batch_timeout_ms must be > 0".to_string(),
        ));
    }

    if config.max_attempts < 1 || config.max_attempts > MAX_INSERT_ATTEMPTS {
        return Err(ConfigError::Validation(format!(
            "max_attempts must be between 1 and {}, got {}",
            MAX_INSERT_ATTEMPTS, config.max_attempts
        )));
    }

    Ok(())
}

fn require_path(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExhaustedPolicy;

    fn persistence() -> PersistenceConfig {
        PersistenceConfig {
            database_path: "harvest.db".to_string(),
            state_path: "state.db".to_string(),
            batch_size: 100,
            batch_timeout_ms: 1000,
            max_attempts: 3,
            backoff_base_ms: 1000,
            on_exhausted: ExhaustedPolicy::FailFast,
        }
    }

    #[test]
    fn test_require_path() {
        assert!(require_path("x", "a.db").is_ok());
        assert!(require_path("x", "").is_err());
        assert!(require_path("x", "   ").is_err());
    }

    #[test]
    fn test_persistence_limits() {
        assert!(validate_persistence_config(&persistence()).is_ok());

        let mut config = persistence();
        config.max_attempts = 0;
        assert!(validate_persistence_config(&config).is_err());

        let mut config = persistence();
        config.max_attempts = 17;
        assert!(validate_persistence_config(&config).is_err());

        let mut config = persistence();
        config.batch_timeout_ms = 0;
        assert!(validate_persistence_config(&config).is_err());
    }

    #[test]
    fn test_directory_rejects_bad_relay() {
        let config = DirectoryConfig {
            plc_db_path: "plc.db".to_string(),
            pairs_path: "pairs.jsonl".to_string(),
            relay_host: "not a host".to_string(),
            default_host_markers: vec!["bsky.social".to_string()],
        };
        assert!(matches!(
            validate_directory_config(&config),
            Err(ConfigError::InvalidHost(_))
        ));
    }
}
