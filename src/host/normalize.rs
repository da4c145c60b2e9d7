/// Normalizes a raw service endpoint into a host name
///
/// # Normalization Steps
///
/// 1. Trim surrounding whitespace
/// 2. Remove a leading `http://` or `https://`
/// 3. Remove trailing slashes
/// 4. Lowercase
/// 5. Replace any host on the platform's default hosting domains with the relay host
///
/// # Arguments
///
/// * `raw` - The endpoint as stored in the directory
/// * `relay_host` - Host that serves every identity on the default domains
/// * `default_markers` - Substrings identifying the default hosting domains
///
/// # Examples
///
/// ```
/// use skyharvest::host::normalize_host;
///
/// let markers = vec!["bsky.social".to_string()];
/// assert_eq!(
///     normalize_host("https://PDS.Example.com/", "relay.example.net", &markers),
///     "pds.example.com"
/// );
/// assert_eq!(
///     normalize_host("https://morel.us-east.host.bsky.social", "relay.example.net", &markers),
///     "relay.example.net"
/// );
/// ```
pub fn normalize_host(raw: &str, relay_host: &str, default_markers: &[String]) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let host = without_scheme.trim_end_matches('/').trim().to_lowercase();

    if default_markers
        .iter()
        .any(|marker| host.contains(&marker.to_lowercase()))
    {
        return relay_host.to_string();
    }

    host
}
