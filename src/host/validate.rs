use crate::{HostError, HostResult};
use url::Url;

/// Maximum length of a single host name label
const MAX_LABEL_LEN: usize = 63;

/// Validates a host name (with optional port) before it is probed or fetched
///
/// A valid host is one or more dot-separated labels of 1 to 63 ASCII
/// alphanumerics or hyphens, no label starting or ending with a hyphen,
/// optionally followed by `:port`. The result must also form a valid
/// `https://host/` URL.
///
/// # Returns
///
/// * `Ok(String)` - The host, unchanged
/// * `Err(HostError)` - The host cannot be used
///
/// # Examples
///
/// ```
/// use skyharvest::host::sanitize_host;
///
/// assert!(sanitize_host("pds.example.com").is_ok());
/// assert!(sanitize_host("pds.example.com:2583").is_ok());
/// assert!(sanitize_host("-bad.example.com").is_err());
/// ```
pub fn sanitize_host(host: &str) -> HostResult<String> {
    if host.is_empty() {
        return Err(HostError::Empty);
    }

    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };

    if let Some(port) = port {
        validate_port(port).map_err(|_| HostError::InvalidPort(host.to_string()))?;
    }

    for label in name.split('.') {
        validate_label(label).map_err(|_| HostError::InvalidHostname(host.to_string()))?;
    }

    Url::parse(&format!("https://{}/", host))
        .map_err(|e| HostError::Malformed(format!("{}: {}", host, e)))?;

    Ok(host.to_string())
}

/// Validates a single host name label
fn validate_label(label: &str) -> Result<(), ()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(());
    }

    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(());
    }

    if label.starts_with('-') || label.ends_with('-') {
        return Err(());
    }

    Ok(())
}

/// Validates a port suffix: 1 to 5 digits, at most 65535
fn validate_port(port: &str) -> Result<(), ()> {
    if port.is_empty() || port.len() > 5 || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(());
    }

    port.parse::<u16>().map(|_| ()).map_err(|_| ())
}
