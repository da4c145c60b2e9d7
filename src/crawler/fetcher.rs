//! Repository fetch client
//!
//! Every identity's repository is requested from the external fetch
//! service, which answers with a newline-delimited JSON stream of records.

use crate::directory::IdentityHostPair;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// Result of a fetch request
#[derive(Debug)]
pub enum FetchResult {
    /// Headers received with a success status; the body is still streaming
    Streaming(Response),

    /// The fetch service answered with a non-success status
    HttpError {
        /// The HTTP status code
        status_code: u16,
    },

    /// Network error (connection refused, timeout before headers, etc.)
    NetworkError {
        /// Error description
        error: String,
    },
}

impl FetchResult {
    /// Returns true if this failure means the repository no longer exists
    ///
    /// The fetch service answers 502 when the identity's host reports the
    /// repository as gone; those are not worth logging.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::HttpError { status_code } if *status_code == StatusCode::BAD_GATEWAY.as_u16())
    }
}

/// Builds the shared HTTP client
///
/// No overall timeout is set: response bodies stream for as long as the
/// repository takes. Header and idle timeouts are applied per request.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(256)
        .gzip(true)
        .brotli(true)
        .build()
}

/// Client for the repository fetch service
#[derive(Debug, Clone)]
pub struct FetchClient {
    client: Client,
    fetch_url: String,
    request_timeout: Duration,
}

impl FetchClient {
    pub fn new(client: Client, fetch_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client,
            fetch_url: fetch_url.into(),
            request_timeout,
        }
    }

    pub fn fetch_url(&self) -> &str {
        &self.fetch_url
    }

    /// Requests an identity's repository stream
    ///
    /// The timeout only covers receiving the response headers.
    pub async fn fetch(&self, pair: &IdentityHostPair) -> FetchResult {
        let request = self.client.post(&self.fetch_url).json(pair).send();

        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    FetchResult::Streaming(response)
                } else {
                    FetchResult::HttpError {
                        status_code: status.as_u16(),
                    }
                }
            }
            Ok(Err(e)) => FetchResult::NetworkError {
                error: e.to_string(),
            },
            Err(_) => FetchResult::NetworkError {
                error: format!(
                    "no response headers within {}s",
                    self.request_timeout.as_secs()
                ),
            },
        }
    }
}
