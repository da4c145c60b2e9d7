//! Host health probing
//!
//! Every distinct host is asked to describe itself once. Results are cached
//! to a JSON file; when that file exists no host is probed.

use crate::config::HealthConfig;
use crate::directory::{HostGroups, IdentityHostPair};
use crate::host::sanitize_host;
use crate::{HarvestError, Result};
use futures::{stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Endpoint every PDS serves to describe itself
pub const DESCRIBE_SERVER_PATH: &str = "/xrpc/com.atproto.server.describeServer";

/// Host name to health
pub type HealthMap = BTreeMap<String, bool>;

/// Statuses worth probing again
const RETRYABLE: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Probes hosts and caches their health
#[derive(Debug, Clone)]
pub struct HostHealthChecker {
    client: Client,
    config: HealthConfig,
    relay_host: String,
}

impl HostHealthChecker {
    pub fn new(client: Client, config: HealthConfig, relay_host: impl Into<String>) -> Self {
        Self {
            client,
            config,
            relay_host: relay_host.into(),
        }
    }

    /// Returns the health of every host in `groups`
    ///
    /// Loads the cache file if present. Otherwise hosts are sanitized,
    /// invalid ones dropped, the rest probed concurrently and the results
    /// written to the cache.
    pub async fn check(&self, groups: &HostGroups) -> Result<HealthMap> {
        let cache = Path::new(&self.config.cache_path);
        if cache.exists() {
            let content = tokio::fs::read_to_string(cache).await?;
            let health: HealthMap = serde_json::from_str(&content)?;
            tracing::info!(
                "Loaded health of {} hosts from {}",
                health.len(),
                cache.display()
            );
            return Ok(health);
        }

        let mut hosts = BTreeSet::new();
        let mut invalid = 0usize;
        for host in groups.keys() {
            match sanitize_host(host) {
                Ok(host) => {
                    hosts.insert(host);
                }
                Err(e) => {
                    tracing::debug!("Dropping host {:?}: {}", host, e);
                    invalid += 1;
                }
            }
        }
        tracing::info!(
            "Sanitization removed {} invalid hosts out of {}",
            invalid,
            groups.len()
        );

        let concurrency = (self.config.concurrency as usize).max(1);
        let health: HealthMap = stream::iter(hosts)
            .map(|host| async move {
                let healthy = host == self.relay_host || self.probe(&host).await;
                tracing::info!("Host {} is healthy: {}", host, healthy);
                (host, healthy)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let json = serde_json::to_string_pretty(&health)?;
        tokio::fs::write(cache, json).await?;

        let healthy = health.values().filter(|h| **h).count();
        tracing::info!(
            "{} healthy hosts, {} unhealthy",
            healthy,
            health.len() - healthy
        );
        Ok(health)
    }

    /// Asks one host to describe itself
    ///
    /// Healthy if the answer is JSON carrying `availableUserDomains`.
    pub async fn probe(&self, host: &str) -> bool {
        let url = match self.describe_url(host) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!("Cannot build probe URL for {}: {}", host, e);
                return false;
            }
        };

        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            let response = match self
                .client
                .get(url.clone())
                .timeout(self.config.timeout())
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!("Probe of {} failed: {}", host, e);
                    return false;
                }
            };

            let status = response.status();
            if RETRYABLE.contains(&status) && attempt < attempts {
                tracing::debug!(
                    "Probe of {} answered {} (attempt {}/{}), retrying",
                    host,
                    status,
                    attempt,
                    attempts
                );
                tokio::time::sleep(RETRY_DELAY * attempt).await;
                continue;
            }
            if !status.is_success() {
                return false;
            }

            return match response.json::<Value>().await {
                Ok(body) => body.get("availableUserDomains").is_some(),
                Err(_) => false,
            };
        }

        false
    }

    fn describe_url(&self, host: &str) -> std::result::Result<Url, HarvestError> {
        Url::parse(&format!("{}://{}{}", self.config.scheme, host, DESCRIBE_SERVER_PATH))
            .map_err(|e| HarvestError::Task(format!("invalid probe URL: {}", e)))
    }
}

/// Keeps the pairs whose host is healthy
///
/// Hosts missing from `health` count as unhealthy.
pub fn select_healthy(groups: &HostGroups, health: &HealthMap) -> Vec<IdentityHostPair> {
    let mut selected = Vec::new();
    let mut unhealthy = 0usize;

    for (host, identities) in groups {
        if health.get(host).copied().unwrap_or(false) {
            selected.extend(
                identities
                    .iter()
                    .map(|identity| IdentityHostPair::new(identity.clone(), host.clone())),
            );
        } else {
            unhealthy += identities.len();
        }
    }

    tracing::info!(
        "{} identities on healthy hosts, {} on unhealthy hosts",
        selected.len(),
        unhealthy
    );
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(entries: &[(&str, &[&str])]) -> HostGroups {
        entries
            .iter()
            .map(|(host, ids)| {
                (
                    host.to_string(),
                    ids.iter().map(|id| id.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_select_healthy() {
        let groups = groups(&[
            ("good.example.com", &["did:plc:a", "did:plc:b"]),
            ("bad.example.com", &["did:plc:c"]),
            ("unknown.example.com", &["did:plc:d"]),
        ]);
        let mut health = HealthMap::new();
        health.insert("good.example.com".to_string(), true);
        health.insert("bad.example.com".to_string(), false);

        let selected = select_healthy(&groups, &health);
        assert_eq!(
            selected,
            vec![
                IdentityHostPair::new("did:plc:a", "good.example.com"),
                IdentityHostPair::new("did:plc:b", "good.example.com"),
            ]
        );
    }

    #[test]
    fn test_describe_url() {
        let checker = HostHealthChecker::new(
            Client::new(),
            HealthConfig {
                cache_path: "unused.json".to_string(),
                concurrency: 1,
                timeout_secs: 1,
                max_retries: 1,
                scheme: "https".to_string(),
            },
            "relay.example.net",
        );
        let url = checker.describe_url("pds.example.com:2583").unwrap();
        assert_eq!(
            url.as_str(),
            "https://pds.example.com:2583/xrpc/com.atproto.server.describeServer"
        );
    }
}
