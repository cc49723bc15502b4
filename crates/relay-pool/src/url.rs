//! Relay URL normalization.
//!
//! Normalized URLs are the identity key for pooling, health tracking, and
//! safety checks, so duplicates from trailing slashes or case differences
//! must collapse to one form.
//!
//! # Normalization Rules
//!
//! - Scheme must be `ws` or `wss`
//! - Scheme and host are lowercased
//! - Trailing slashes are removed
//! - Ports and paths are preserved

use url::Url;

use crate::error::{Error, Result};

/// Normalize a relay URL.
///
/// # Examples
///
/// ```
/// use relay_pool::normalize_relay_url;
///
/// assert_eq!(
///     normalize_relay_url("wss://Relay.Example.COM/").unwrap(),
///     "wss://relay.example.com"
/// );
/// assert!(normalize_relay_url("https://relay.example.com").is_err());
/// ```
pub fn normalize_relay_url(url: &str) -> Result<String> {
    let trimmed = url.trim();

    let parsed = Url::parse(trimmed).map_err(|e| Error::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::InvalidUrl {
                url: trimmed.to_string(),
                reason: format!("scheme must be ws or wss, got '{}'", other),
            });
        }
    }

    if parsed.host_str().is_none() {
        return Err(Error::InvalidUrl {
            url: trimmed.to_string(),
            reason: "missing hostname".to_string(),
        });
    }

    // The url crate already lowercases scheme and host.
    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }

    Ok(normalized)
}

/// Extract the hostname of a relay URL, without brackets for IPv6 literals.
///
/// Returns `None` for URLs that do not parse or have no host.
pub(crate) fn hostname_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trailing_slash() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com/").unwrap(),
            "wss://relay.example.com"
        );
        assert_eq!(
            normalize_relay_url("wss://relay.example.com///").unwrap(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_lowercases_host() {
        assert_eq!(
            normalize_relay_url("WSS://Relay.Example.COM").unwrap(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_normalize_preserves_port_and_path() {
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:8080/nostr/").unwrap(),
            "wss://relay.example.com:8080/nostr"
        );
        // Default port is dropped by the parser.
        assert_eq!(
            normalize_relay_url("wss://relay.example.com:443").unwrap(),
            "wss://relay.example.com"
        );
    }

    #[test]
    fn test_reject_non_websocket_scheme() {
        assert!(matches!(
            normalize_relay_url("https://relay.example.com"),
            Err(Error::InvalidUrl { .. })
        ));
        assert!(matches!(
            normalize_relay_url("relay.example.com"),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_same_identity_after_normalization() {
        let a = normalize_relay_url("wss://relay.damus.io").unwrap();
        let b = normalize_relay_url("wss://relay.damus.io/").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hostname_of() {
        assert_eq!(
            hostname_of("wss://relay.example.com:8080/path").as_deref(),
            Some("relay.example.com")
        );
        assert_eq!(hostname_of("ws://[::1]:7777").as_deref(), Some("::1"));
        assert_eq!(hostname_of("not a url"), None);
    }
}
