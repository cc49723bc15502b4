//! Per-relay health tracking: dial backoff, response-time averages, and a
//! composite 0-100 score used for relay selection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::HealthConfig;

#[derive(Debug, Clone, Default)]
struct RelayHealth {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    avg_response: Option<Duration>,
    sample_count: u32,
}

/// A point-in-time snapshot of one relay's health record.
#[derive(Debug, Clone)]
pub struct RelayHealthDetail {
    pub url: String,
    pub score: i64,
    pub avg_response: Option<Duration>,
    pub sample_count: u32,
    pub consecutive_failures: u32,
    pub backed_off: bool,
}

/// Aggregate counts across all tracked relays.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayHealthStats {
    pub tracked: usize,
    pub backed_off: usize,
    pub with_samples: usize,
}

/// Tracks dial outcomes and response times per relay URL.
pub struct RelayHealthTracker {
    config: HealthConfig,
    relays: Mutex<HashMap<String, RelayHealth>>,
}

impl RelayHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            relays: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful dial, clearing any failure streak and backoff.
    pub fn record_success(&self, url: &str) {
        let mut relays = self.relays.lock();
        let health = relays.entry(url.to_string()).or_default();
        health.consecutive_failures = 0;
        health.backoff_until = None;
    }

    /// Record a dial failure and advance the backoff ladder.
    ///
    /// Callers must not report failures caused by their own cancellation;
    /// those say nothing about the relay.
    pub fn record_failure(&self, url: &str) {
        let mut relays = self.relays.lock();
        let health = relays.entry(url.to_string()).or_default();
        health.consecutive_failures += 1;

        let schedule = &self.config.backoff_schedule;
        let idx = (health.consecutive_failures as usize).saturating_sub(1);
        // An empty schedule counts failures but never backs off.
        let Some(backoff) = schedule.get(idx).or_else(|| schedule.last()).copied() else {
            return;
        };
        health.backoff_until = Some(Instant::now() + backoff);
        debug!(
            url,
            failures = health.consecutive_failures,
            backoff_secs = backoff.as_secs(),
            "relay dial failed, backing off"
        );
    }

    /// Fold one response-time sample into the relay's moving average.
    pub fn record_response_time(&self, url: &str, elapsed: Duration) {
        let mut relays = self.relays.lock();
        let health = relays.entry(url.to_string()).or_default();
        health.avg_response = Some(match health.avg_response {
            None => elapsed,
            Some(avg) => {
                let alpha = self.config.ema_alpha;
                Duration::from_secs_f64(
                    alpha * elapsed.as_secs_f64() + (1.0 - alpha) * avg.as_secs_f64(),
                )
            }
        });
        health.sample_count += 1;
    }

    /// Whether the relay is inside its backoff window.
    pub fn should_skip(&self, url: &str) -> bool {
        self.backoff_remaining(url).is_some()
    }

    /// Time left in the relay's backoff window, if any.
    pub fn backoff_remaining(&self, url: &str) -> Option<Duration> {
        let relays = self.relays.lock();
        let until = relays.get(url)?.backoff_until?;
        until.checked_duration_since(Instant::now())
    }

    /// Composite health score in [0, 100]; higher is better.
    pub fn score(&self, url: &str) -> i64 {
        let relays = self.relays.lock();
        match relays.get(url) {
            Some(health) => self.score_of(health),
            None => self.config.medium_base,
        }
    }

    fn score_of(&self, health: &RelayHealth) -> i64 {
        let c = &self.config;

        let base = match health.avg_response {
            None => c.medium_base,
            Some(avg) if avg < c.fast_threshold => c.fast_base,
            Some(avg) if avg < c.medium_threshold => c.medium_base,
            Some(avg) if avg < c.slow_threshold => c.slow_base,
            Some(_) => c.floor_base,
        };

        let sample_bonus = (health.sample_count as i64).min(c.sample_bonus_cap);
        let failure_penalty =
            (health.consecutive_failures as i64 * c.failure_penalty).min(c.failure_penalty_cap);
        let backoff_penalty = match health.backoff_until {
            Some(until) if until > Instant::now() => c.backoff_penalty,
            _ => 0,
        };

        (base + sample_bonus - failure_penalty - backoff_penalty).clamp(0, 100)
    }

    /// Order relay URLs by descending score; equal scores keep input order.
    pub fn sort_relays_by_score(&self, urls: &[String]) -> Vec<String> {
        let relays = self.relays.lock();
        let mut scored: Vec<(String, i64)> = urls
            .iter()
            .map(|url| {
                let score = relays
                    .get(url)
                    .map(|h| self.score_of(h))
                    .unwrap_or(self.config.medium_base);
                (url.clone(), score)
            })
            .collect();
        scored.sort_by_key(|(_, score)| std::cmp::Reverse(*score));
        scored.into_iter().map(|(url, _)| url).collect()
    }

    /// How long a caller should wait for `min_relays` of the given relays
    /// to respond: the (min_relays - 1)-th fastest average latency plus a
    /// buffer, clamped to a sane window.
    pub fn expected_response_time(&self, urls: &[String], min_relays: usize) -> Duration {
        let relays = self.relays.lock();
        let mut averages: Vec<Duration> = urls
            .iter()
            .filter_map(|url| relays.get(url).and_then(|h| h.avg_response))
            .collect();

        if averages.is_empty() {
            return self.config.max_expected_response;
        }
        averages.sort();

        let idx = min_relays.saturating_sub(1).min(averages.len() - 1);
        let buffered = averages[idx].mul_f64(self.config.response_buffer_factor);
        buffered.clamp(
            self.config.min_expected_response,
            self.config.max_expected_response,
        )
    }

    /// Aggregate stats over all tracked relays.
    pub fn stats(&self) -> RelayHealthStats {
        let relays = self.relays.lock();
        let now = Instant::now();
        RelayHealthStats {
            tracked: relays.len(),
            backed_off: relays
                .values()
                .filter(|h| matches!(h.backoff_until, Some(until) if until > now))
                .count(),
            with_samples: relays.values().filter(|h| h.sample_count > 0).count(),
        }
    }

    /// Per-relay snapshot for all tracked relays, unordered.
    pub fn details(&self) -> Vec<RelayHealthDetail> {
        let relays = self.relays.lock();
        let now = Instant::now();
        relays
            .iter()
            .map(|(url, health)| RelayHealthDetail {
                url: url.clone(),
                score: self.score_of(health),
                avg_response: health.avg_response,
                sample_count: health.sample_count,
                consecutive_failures: health.consecutive_failures,
                backed_off: matches!(health.backoff_until, Some(until) if until > now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RelayHealthTracker {
        RelayHealthTracker::new(HealthConfig::default())
    }

    /// A config whose backoff windows expire immediately, so failure counts
    /// can be tested without the backoff penalty.
    fn no_backoff_tracker() -> RelayHealthTracker {
        RelayHealthTracker::new(HealthConfig {
            backoff_schedule: vec![Duration::ZERO],
            ..HealthConfig::default()
        })
    }

    #[test]
    fn test_backoff_ladder() {
        let t = tracker();
        t.record_failure("wss://a");
        let first = t.backoff_remaining("wss://a").unwrap();
        assert!(first <= Duration::from_secs(30));
        assert!(first > Duration::from_secs(25));

        t.record_failure("wss://a");
        t.record_failure("wss://a");
        t.record_failure("wss://a");
        t.record_failure("wss://a");
        // 5th failure stays at the ladder's last rung.
        let capped = t.backoff_remaining("wss://a").unwrap();
        assert!(capped <= Duration::from_secs(300));
        assert!(capped > Duration::from_secs(295));
        assert!(t.should_skip("wss://a"));
    }

    #[test]
    fn test_empty_backoff_schedule_counts_failures_only() {
        let t = RelayHealthTracker::new(HealthConfig {
            backoff_schedule: Vec::new(),
            ..HealthConfig::default()
        });
        t.record_failure("wss://a");
        t.record_failure("wss://a");
        assert!(!t.should_skip("wss://a"));
        assert_eq!(t.backoff_remaining("wss://a"), None);
        // Failures still show up in the score and the details.
        let detail = t.details().pop().unwrap();
        assert_eq!(detail.consecutive_failures, 2);
        assert!(!detail.backed_off);
    }

    #[test]
    fn test_success_clears_backoff() {
        let t = tracker();
        t.record_failure("wss://a");
        assert!(t.should_skip("wss://a"));
        t.record_success("wss://a");
        assert!(!t.should_skip("wss://a"));
        assert_eq!(t.backoff_remaining("wss://a"), None);
    }

    #[test]
    fn test_ema_smoothing() {
        let t = tracker();
        t.record_response_time("wss://a", Duration::from_millis(100));
        t.record_response_time("wss://a", Duration::from_millis(200));
        // 0.3 * 200 + 0.7 * 100 = 130ms
        let detail = t.details().pop().unwrap();
        let avg = detail.avg_response.unwrap();
        assert!(avg >= Duration::from_millis(129) && avg <= Duration::from_millis(131));
        assert_eq!(detail.sample_count, 2);
    }

    #[test]
    fn test_score_latency_buckets() {
        let t = tracker();
        t.record_response_time("fast", Duration::from_millis(100));
        t.record_response_time("medium", Duration::from_millis(300));
        t.record_response_time("slow", Duration::from_millis(700));
        t.record_response_time("glacial", Duration::from_millis(1500));

        assert_eq!(t.score("fast"), 51);
        assert_eq!(t.score("medium"), 41);
        assert_eq!(t.score("slow"), 26);
        assert_eq!(t.score("glacial"), 11);
    }

    #[test]
    fn test_score_orders_by_failures() {
        let t = no_backoff_tracker();
        for url in ["clean", "one-failure", "four-failures"] {
            t.record_response_time(url, Duration::from_millis(100));
        }
        t.record_failure("one-failure");
        for _ in 0..4 {
            t.record_failure("four-failures");
        }

        let clean = t.score("clean");
        let one = t.score("one-failure");
        let four = t.score("four-failures");
        assert!(one < clean, "{} !< {}", one, clean);
        assert!(one > four, "{} !> {}", one, four);
    }

    #[test]
    fn test_backoff_penalty_applies_while_active() {
        let t = tracker();
        t.record_response_time("wss://a", Duration::from_millis(100));
        let before = t.score("wss://a");
        t.record_failure("wss://a");
        // -10 failure penalty, -20 backoff penalty
        assert_eq!(t.score("wss://a"), before - 30);
    }

    #[test]
    fn test_unknown_relay_scores_neutral() {
        let t = tracker();
        assert_eq!(t.score("wss://never-seen"), 40);
    }

    #[test]
    fn test_sort_relays_by_score_stable_descending() {
        let t = tracker();
        t.record_response_time("wss://fast", Duration::from_millis(50));
        t.record_response_time("wss://slow", Duration::from_millis(1500));

        let urls = vec![
            "wss://slow".to_string(),
            "wss://unknown-a".to_string(),
            "wss://fast".to_string(),
            "wss://unknown-b".to_string(),
        ];
        let sorted = t.sort_relays_by_score(&urls);
        assert_eq!(sorted[0], "wss://fast");
        // Equal (neutral) scores keep their input order.
        assert_eq!(sorted[1], "wss://unknown-a");
        assert_eq!(sorted[2], "wss://unknown-b");
        assert_eq!(sorted[3], "wss://slow");
    }

    #[test]
    fn test_expected_response_time() {
        let t = tracker();
        t.record_response_time("wss://a", Duration::from_millis(200));
        t.record_response_time("wss://b", Duration::from_millis(400));
        t.record_response_time("wss://c", Duration::from_millis(800));
        let urls: Vec<String> = ["wss://a", "wss://b", "wss://c"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // 2nd fastest = 400ms, * 1.5 = 600ms
        assert_eq!(
            t.expected_response_time(&urls, 2),
            Duration::from_millis(600)
        );
        // Fastest = 200ms, * 1.5 = 300ms
        assert_eq!(
            t.expected_response_time(&urls, 1),
            Duration::from_millis(300)
        );
        // min_relays beyond the candidate count falls back to the slowest.
        assert_eq!(
            t.expected_response_time(&urls, 10),
            Duration::from_millis(1200)
        );
    }

    #[test]
    fn test_expected_response_time_clamped() {
        let t = tracker();
        t.record_response_time("wss://instant", Duration::from_millis(10));
        t.record_response_time("wss://tarpit", Duration::from_secs(10));

        let instant = vec!["wss://instant".to_string()];
        assert_eq!(
            t.expected_response_time(&instant, 1),
            Duration::from_millis(200)
        );

        let tarpit = vec!["wss://tarpit".to_string()];
        assert_eq!(t.expected_response_time(&tarpit, 1), Duration::from_secs(2));

        // No data at all: wait the maximum window.
        assert_eq!(
            t.expected_response_time(&[], 1),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_stats_counts() {
        let t = tracker();
        t.record_response_time("wss://a", Duration::from_millis(100));
        t.record_failure("wss://b");
        t.record_success("wss://c");

        let stats = t.stats();
        assert_eq!(stats.tracked, 3);
        assert_eq!(stats.backed_off, 1);
        assert_eq!(stats.with_samples, 1);
    }
}
