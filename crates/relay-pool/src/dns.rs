//! TTL-bounded DNS resolution cache.
//!
//! Caches hostname-to-IP resolutions so the safety validator does not hit
//! the resolver on every dial of a popular relay. Failed lookups are never
//! cached; a flaky resolver should not pin a relay as unreachable.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::lookup_host;

#[derive(Debug, Clone)]
struct DnsEntry {
    ips: Vec<IpAddr>,
    resolved_at: Instant,
    expires_at: Instant,
}

/// Size-bounded DNS cache with TTL expiry.
pub struct DnsCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, DnsEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a hostname, serving from cache while the entry is fresh.
    pub async fn resolve(&self, hostname: &str) -> std::io::Result<Vec<IpAddr>> {
        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(hostname) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.ips.clone());
                }
            }
        }

        // Port is irrelevant; lookup_host requires one.
        let addrs = lookup_host((hostname, 443u16)).await?;
        let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        if ips.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses returned",
            ));
        }

        self.insert(hostname, ips.clone());
        Ok(ips)
    }

    /// Insert a resolution result, evicting the oldest 10% when full.
    pub fn insert(&self, hostname: &str, ips: Vec<IpAddr>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.len() >= self.max_entries && !entries.contains_key(hostname) {
            Self::evict_oldest(&mut entries, self.max_entries / 10);
        }

        entries.insert(
            hostname.to_string(),
            DnsEntry {
                ips,
                resolved_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    fn evict_oldest(entries: &mut HashMap<String, DnsEntry>, count: usize) {
        let count = count.max(1);
        let mut by_age: Vec<(String, Instant)> = entries
            .iter()
            .map(|(host, e)| (host.clone(), e.resolved_at))
            .collect();
        by_age.sort_by_key(|(_, resolved_at)| *resolved_at);

        for (host, _) in by_age.into_iter().take(count) {
            entries.remove(&host);
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
