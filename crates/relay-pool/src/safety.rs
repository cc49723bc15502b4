//! Destination safety validation for outbound relay dials.
//!
//! Relay URLs are largely self-declared by users, so the policy is
//! availability-leaning: a hostname that fails to resolve is allowed
//! through (the dial will fail on its own), but a hostname that resolves
//! to a private, link-local, or otherwise internal address is refused
//! before any socket is opened. Loopback is always allowed so local
//! development relays work.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::PoolConfig;
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::url::hostname_of;

/// Hostname suffixes that only resolve on internal networks.
const INTERNAL_SUFFIXES: &[&str] = &[".local", ".internal", ".localdomain", ".lan", ".home.arpa"];

/// The cloud-provider instance metadata endpoint.
const METADATA_ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(169, 254, 169, 254));

/// Validates that a relay URL is safe to dial.
pub struct DestinationValidator {
    dns: Arc<DnsCache>,
}

impl DestinationValidator {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            dns: Arc::new(DnsCache::new(config.dns_ttl, config.dns_max_entries)),
        }
    }

    /// Shared DNS cache, also swept by the pool's maintenance task.
    pub fn dns(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    /// Check a normalized relay URL against the safety policy.
    ///
    /// Check order: hostname present, internal-suffix denylist, loopback
    /// allowance, then DNS resolution with IP classification. Resolution
    /// failure is allowed through unless the hostname carries a trailing
    /// dot, which marks a deliberate absolute name that should resolve.
    pub async fn check(&self, url: &str) -> Result<()> {
        let hostname = hostname_of(url).ok_or_else(|| Error::InvalidUrl {
            url: url.to_string(),
            reason: "missing hostname".to_string(),
        })?;

        let bare = hostname.trim_end_matches('.');
        let lowered = bare.to_ascii_lowercase();

        for suffix in INTERNAL_SUFFIXES {
            if lowered.ends_with(suffix) {
                return Err(Error::UnsafeDestination {
                    url: url.to_string(),
                    reason: format!("internal-only hostname suffix '{}'", suffix),
                });
            }
        }

        if lowered == "localhost" {
            return Ok(());
        }

        if let Ok(ip) = bare.parse::<IpAddr>() {
            return self.classify(url, &[ip]);
        }

        let ips = match self.dns.resolve(bare).await {
            Ok(ips) => ips,
            Err(e) => {
                if hostname.ends_with('.') {
                    return Err(Error::UnsafeDestination {
                        url: url.to_string(),
                        reason: format!("unresolvable absolute hostname: {}", e),
                    });
                }
                debug!(url, error = %e, "hostname unresolvable, allowing dial to fail on its own");
                return Ok(());
            }
        };

        self.classify(url, &ips)
    }

    fn classify(&self, url: &str, ips: &[IpAddr]) -> Result<()> {
        for ip in ips {
            if ip.is_loopback() {
                continue;
            }
            if let Some(reason) = deny_reason(*ip) {
                return Err(Error::UnsafeDestination {
                    url: url.to_string(),
                    reason: format!("resolves to {} address {}", reason, ip),
                });
            }
        }
        Ok(())
    }
}

/// Why an IP is refused as a dial target, or `None` if it is acceptable.
fn deny_reason(ip: IpAddr) -> Option<&'static str> {
    if ip == METADATA_ADDR {
        return Some("cloud metadata");
    }
    if ip.is_unspecified() {
        return Some("unspecified");
    }
    if ip.is_multicast() {
        return Some("multicast");
    }
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_private() {
                Some("private")
            } else if v4.is_link_local() {
                Some("link-local")
            } else {
                None
            }
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local and fe80::/10 link-local.
            if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                Some("private")
            } else if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                Some("link-local")
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn validator() -> DestinationValidator {
        DestinationValidator::new(&PoolConfig::default())
    }

    fn seed(v: &DestinationValidator, host: &str, ips: &[[u8; 4]]) {
        v.dns().insert(
            host,
            ips.iter()
                .map(|[a, b, c, d]| IpAddr::V4(Ipv4Addr::new(*a, *b, *c, *d)))
                .collect(),
        );
    }

    #[tokio::test]
    async fn test_private_ip_denied() {
        let v = validator();
        seed(&v, "relay.example.com", &[[10, 0, 0, 5]]);
        assert!(matches!(
            v.check("wss://relay.example.com").await,
            Err(Error::UnsafeDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_loopback_resolution_allowed() {
        let v = validator();
        seed(&v, "relay.example.com", &[[127, 0, 0, 1]]);
        assert!(v.check("wss://relay.example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_localhost_allowed_without_resolution() {
        let v = validator();
        assert!(v.check("ws://localhost:7777").await.is_ok());
        assert!(v.check("ws://127.0.0.1:7777").await.is_ok());
    }

    #[tokio::test]
    async fn test_internal_suffix_denied() {
        let v = validator();
        for url in [
            "ws://relay.local",
            "ws://db.internal",
            "ws://nas.lan",
            "ws://printer.home.arpa",
        ] {
            assert!(
                matches!(v.check(url).await, Err(Error::UnsafeDestination { .. })),
                "{} should be denied",
                url
            );
        }
    }

    #[tokio::test]
    async fn test_unresolvable_allowed() {
        let v = validator();
        // .invalid never resolves; policy allows the dial to fail naturally.
        assert!(v.check("wss://relay.does-not-exist.invalid").await.is_ok());
    }

    #[tokio::test]
    async fn test_unresolvable_trailing_dot_denied() {
        let v = validator();
        assert!(matches!(
            v.check("wss://relay.does-not-exist.invalid.").await,
            Err(Error::UnsafeDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_metadata_address_denied() {
        let v = validator();
        assert!(matches!(
            v.check("ws://169.254.169.254").await,
            Err(Error::UnsafeDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_mixed_resolution_denied_on_any_bad_ip() {
        let v = validator();
        seed(&v, "relay.example.com", &[[93, 184, 216, 34], [192, 168, 1, 1]]);
        assert!(matches!(
            v.check("wss://relay.example.com").await,
            Err(Error::UnsafeDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_public_resolution_allowed() {
        let v = validator();
        seed(&v, "relay.example.com", &[[93, 184, 216, 34]]);
        assert!(v.check("wss://relay.example.com").await.is_ok());
    }

    #[test]
    fn test_deny_reason_v6() {
        assert_eq!(deny_reason("fd00::1".parse().unwrap()), Some("private"));
        assert_eq!(deny_reason("fe80::1".parse().unwrap()), Some("link-local"));
        assert_eq!(deny_reason("2606:4700::1".parse().unwrap()), None);
    }
}
