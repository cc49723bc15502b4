//! Configuration for the relay pool and the health tracker.

use std::collections::HashSet;
use std::time::Duration;

/// Configuration for a [`RelayPool`](crate::RelayPool).
///
/// The defaults are the tuning values the pool was operated with in
/// production; tests construct smaller pools by overriding fields.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard ceiling on concurrent relay connections.
    pub max_connections: usize,
    /// Connection count at which LRU eviction is attempted before dialing.
    pub eviction_threshold: usize,
    /// How many slots eviction tries to keep free below the ceiling.
    pub eviction_target_free: usize,
    /// Minimum idle time before a zero-subscription connection is evictable.
    pub min_idle_for_eviction: Duration,

    /// Maximum concurrent subscriptions per relay.
    pub max_subs_per_relay: usize,
    /// How long a subscriber waits for a per-relay slot.
    pub slot_acquire_timeout: Duration,

    /// WebSocket dial + handshake deadline.
    pub dial_timeout: Duration,
    /// Deadline for a single outbound frame write.
    pub write_timeout: Duration,
    /// Shared deadline for best-effort warmup dialing.
    pub warmup_timeout: Duration,

    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Maximum silence since the last pong before the peer is declared dead.
    pub pong_timeout: Duration,
    /// Rolling read deadline; longer than ping interval + pong timeout so
    /// keepalive jitter does not trip it.
    pub read_deadline: Duration,

    /// Idle time after which a zero-subscription connection is reaped.
    pub idle_cleanup_threshold: Duration,
    /// Period of the maintenance sweep (idle reaping, DNS/write-only expiry).
    pub sweep_interval: Duration,

    /// TTL of cached DNS resolutions.
    pub dns_ttl: Duration,
    /// Maximum DNS cache entries before oldest-10% eviction.
    pub dns_max_entries: usize,

    /// How long a NOTICE-detected write-only marking lasts.
    pub write_only_ttl: Duration,
    /// Relays statically known to reject REQ (never expire).
    pub write_only_relays: HashSet<String>,

    /// Health scoring and backoff tuning.
    pub health: HealthConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 150,
            eviction_threshold: 140,
            eviction_target_free: 20,
            min_idle_for_eviction: Duration::from_secs(30),
            max_subs_per_relay: 10,
            slot_acquire_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            warmup_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            read_deadline: Duration::from_secs(90),
            idle_cleanup_threshold: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(60),
            dns_ttl: Duration::from_secs(300),
            dns_max_entries: 500,
            write_only_ttl: Duration::from_secs(3600),
            write_only_relays: HashSet::new(),
            health: HealthConfig::default(),
        }
    }
}

/// Tuning for relay health scoring and dial backoff.
///
/// The scoring constants are empirical; the defaults reproduce the values
/// the scoring was calibrated with and most deployments should keep them.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Smoothing factor for the response-time moving average.
    pub ema_alpha: f64,
    /// Backoff after the 1st, 2nd, 3rd, and 4th+ consecutive dial failure.
    pub backoff_schedule: Vec<Duration>,

    /// Latency below this scores `fast_base`.
    pub fast_threshold: Duration,
    /// Latency below this scores `medium_base`.
    pub medium_threshold: Duration,
    /// Latency below this scores `slow_base`.
    pub slow_threshold: Duration,
    /// Base score buckets, fastest to slowest.
    pub fast_base: i64,
    pub medium_base: i64,
    pub slow_base: i64,
    pub floor_base: i64,

    /// Bonus of +1 per latency sample, capped here.
    pub sample_bonus_cap: i64,
    /// Penalty per recorded failure.
    pub failure_penalty: i64,
    /// Cap on the total failure penalty.
    pub failure_penalty_cap: i64,
    /// Flat penalty while the relay is inside backoff.
    pub backoff_penalty: i64,

    /// Clamp bounds and buffer for expected-response-time estimates.
    pub min_expected_response: Duration,
    pub max_expected_response: Duration,
    pub response_buffer_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            backoff_schedule: vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ],
            fast_threshold: Duration::from_millis(200),
            medium_threshold: Duration::from_millis(500),
            slow_threshold: Duration::from_millis(1000),
            fast_base: 50,
            medium_base: 40,
            slow_base: 25,
            floor_base: 10,
            sample_bonus_cap: 10,
            failure_penalty: 10,
            failure_penalty_cap: 30,
            backoff_penalty: 20,
            min_expected_response: Duration::from_millis(200),
            max_expected_response: Duration::from_secs(2),
            response_buffer_factor: 1.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 150);
        assert_eq!(config.eviction_threshold, 140);
        assert_eq!(config.eviction_target_free, 20);
        assert_eq!(config.max_subs_per_relay, 10);
        assert_eq!(config.dns_max_entries, 500);
        assert!(config.eviction_threshold < config.max_connections);
    }

    #[test]
    fn test_read_deadline_exceeds_keepalive_cycle() {
        let config = PoolConfig::default();
        assert!(config.read_deadline > config.pong_timeout);
        assert!(config.read_deadline > config.ping_interval);
    }

    #[test]
    fn test_default_backoff_ladder() {
        let health = HealthConfig::default();
        assert_eq!(
            health.backoff_schedule,
            vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ]
        );
    }
}
