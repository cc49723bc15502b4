//! The shared relay connection pool.
//!
//! Owns the connection map, per-URL dial locks, per-relay subscription
//! slots, the safety validator, health tracking, and the maintenance
//! sweeper. All public operations go through the pool; connections never
//! outlive it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::connection::{PublishAck, RelayConnection};
use crate::error::{Error, Result};
use crate::health::{RelayHealthDetail, RelayHealthStats, RelayHealthTracker};
use crate::protocol::{close_frame, event_frame, req_frame};
use crate::safety::DestinationValidator;
use crate::subscription::SubscriptionHandle;
use crate::url::normalize_relay_url;
use crate::EventParser;

/// NOTICE phrases that mean the relay refuses REQ subscriptions.
const REQ_UNSUPPORTED_PHRASES: &[&str] = &[
    "does not accept req",
    "req not supported",
    "subscriptions are not allowed",
    "write-only",
];

/// Relays known (statically or from NOTICE frames) to reject REQ.
pub(crate) struct WriteOnlyCache {
    ttl: Duration,
    static_urls: HashSet<String>,
    detected: Mutex<HashMap<String, Instant>>,
}

impl WriteOnlyCache {
    pub(crate) fn new(ttl: Duration, static_urls: HashSet<String>) -> Self {
        Self {
            ttl,
            static_urls,
            detected: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn is_write_only(&self, url: &str) -> bool {
        if self.static_urls.contains(url) {
            return true;
        }
        let detected = self.detected.lock();
        matches!(detected.get(url), Some(marked) if marked.elapsed() < self.ttl)
    }

    /// Mark a relay write-only for the cache TTL.
    pub(crate) fn mark(&self, url: &str) {
        self.detected.lock().insert(url.to_string(), Instant::now());
    }

    pub(crate) fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.detected.lock().retain(|_, marked| marked.elapsed() < ttl);
    }

    /// Whether a NOTICE text indicates the relay rejects REQ.
    pub(crate) fn req_unsupported(notice: &str) -> bool {
        let lowered = notice.to_lowercase();
        REQ_UNSUPPORTED_PHRASES
            .iter()
            .any(|phrase| lowered.contains(phrase))
    }
}

/// Event-queue capacity for a subscription: twice the requested limit,
/// clamped so tiny filters still buffer bursts and huge ones stay bounded.
fn queue_capacity(filter: &Value) -> usize {
    let limit = filter.get("limit").and_then(Value::as_u64).unwrap_or(0) as usize;
    (limit * 2).clamp(50, 500)
}

/// A pool of supervised relay connections, at most one per normalized URL.
///
/// Construct with [`RelayPool::new`] inside a tokio runtime; the pool
/// spawns a maintenance sweeper that lives until [`RelayPool::close`].
pub struct RelayPool<P: EventParser> {
    config: PoolConfig,
    parser: Arc<P>,
    conns: RwLock<HashMap<String, Arc<RelayConnection<P>>>>,
    dial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    validator: DestinationValidator,
    health: RelayHealthTracker,
    write_only: Arc<WriteOnlyCache>,
    dropped_events: Arc<AtomicU64>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<P: EventParser> RelayPool<P> {
    pub fn new(config: PoolConfig, parser: P) -> Arc<Self> {
        let write_only = Arc::new(WriteOnlyCache::new(
            config.write_only_ttl,
            config.write_only_relays.clone(),
        ));
        let pool = Arc::new(Self {
            validator: DestinationValidator::new(&config),
            health: RelayHealthTracker::new(config.health.clone()),
            parser: Arc::new(parser),
            conns: RwLock::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            write_only,
            dropped_events: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
            config,
        });

        let sweeper = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&pool),
            pool.shutdown.clone(),
            pool.config.sweep_interval,
        ));
        *pool.sweeper.lock() = Some(sweeper);
        pool
    }

    /// Open a subscription on a relay, dialing it if necessary.
    ///
    /// Acquires one of the relay's concurrency slots first; the slot is
    /// held for the life of the subscription and released when it closes.
    pub async fn subscribe(
        &self,
        url: &str,
        sub_id: &str,
        filter: &Value,
    ) -> Result<SubscriptionHandle<P::Event>> {
        let url = normalize_relay_url(url)?;

        if self.write_only.is_write_only(&url) {
            return Err(Error::WriteOnlyRelay { url });
        }

        let semaphore = {
            let mut slots = self.slots.lock();
            Arc::clone(
                slots
                    .entry(url.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_subs_per_relay))),
            )
        };
        let permit = match timeout(
            self.config.slot_acquire_timeout,
            semaphore.acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(Error::SlotTimeout { url }),
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        // A connection can die between lookup and use; retry past stale
        // entries a few times before giving up.
        let mut conn = None;
        for _ in 0..3 {
            let candidate = self.get_or_create_conn(&url).await?;
            if candidate.is_closed() {
                self.remove_conn_if_same(&url, &candidate);
                continue;
            }
            conn = Some(candidate);
            break;
        }
        let conn = conn.ok_or_else(|| Error::ConnectionClosed { url: url.clone() })?;

        let handle = conn.register_subscription(sub_id, queue_capacity(filter), Some(permit))?;
        if let Err(e) = conn.send_text(req_frame(sub_id, filter)).await {
            conn.remove_subscription(sub_id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Close a subscription: best-effort CLOSE frame, then local removal.
    /// Idempotent; unknown subscriptions are a no-op.
    pub async fn unsubscribe(&self, url: &str, sub_id: &str) -> Result<()> {
        let url = normalize_relay_url(url)?;
        let conn = self.conns.read().get(&url).cloned();
        if let Some(conn) = conn {
            if !conn.is_closed() && conn.remove_subscription(sub_id) {
                let _ = conn.send_text(close_frame(sub_id)).await;
            }
        }
        Ok(())
    }

    /// Publish an event and wait for the relay's OK verdict.
    ///
    /// The waiter is always deregistered, whether the ack arrives, the
    /// deadline passes, or the caller's future is dropped mid-wait.
    pub async fn publish_event(
        &self,
        url: &str,
        event_id: &str,
        event: &Value,
        ack_timeout: Duration,
    ) -> Result<PublishAck> {
        let url = normalize_relay_url(url)?;
        let conn = self.get_or_create_conn(&url).await?;

        let rx = conn.register_publish(event_id)?;
        let _guard = PublishGuard {
            conn: &conn,
            event_id,
        };

        conn.send_text(event_frame(event)).await?;

        match timeout(ack_timeout, rx).await {
            Err(_) => Err(Error::PublishTimeout {
                event_id: event_id.to_string(),
            }),
            Ok(Err(_)) => Err(Error::ConnectionClosed { url }),
            Ok(Ok(ack)) => Ok(ack),
        }
    }

    /// Whether a live connection to the relay currently exists.
    pub fn is_connected(&self, url: &str) -> bool {
        match normalize_relay_url(url) {
            Ok(url) => matches!(self.conns.read().get(&url), Some(c) if !c.is_closed()),
            Err(_) => false,
        }
    }

    /// Normalized URLs of all live connections.
    pub fn connected_relays(&self) -> Vec<String> {
        self.conns
            .read()
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Best-effort parallel dial of a set of relays under one shared
    /// deadline. Returns how many connected.
    pub async fn warmup_connections(&self, urls: &[String]) -> usize {
        let dials = urls.iter().map(|url| async move {
            match self.get_or_create_conn_normalizing(url).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(url = %url, error = %e, "warmup dial failed");
                    false
                }
            }
        });
        let results = timeout(
            self.config.warmup_timeout,
            futures_util::future::join_all(dials),
        )
        .await
        .unwrap_or_default();
        let connected = results.into_iter().filter(|ok| *ok).count();
        info!(connected, requested = urls.len(), "relay warmup finished");
        connected
    }

    /// Shut the pool down: stop the sweeper, tear down every connection,
    /// and fail all of their dependents. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        let conns: Vec<_> = {
            let mut map = self.conns.write();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.shutdown_and_join().await;
        }
        gauge!("relay_pool_connections").set(0.0);
        info!("relay pool closed");
    }

    pub fn relay_health_stats(&self) -> RelayHealthStats {
        self.health.stats()
    }

    pub fn relay_health_details(&self) -> Vec<RelayHealthDetail> {
        self.health.details()
    }

    /// Relay URLs ordered best-first by health score.
    pub fn sort_relays_by_score(&self, urls: &[String]) -> Vec<String> {
        self.health.sort_relays_by_score(urls)
    }

    /// How long to wait for `min_relays` of the given relays to answer.
    pub fn expected_response_time(&self, urls: &[String], min_relays: usize) -> Duration {
        self.health.expected_response_time(urls, min_relays)
    }

    /// Events dropped on queue overflow since the pool was created.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    async fn get_or_create_conn_normalizing(
        &self,
        url: &str,
    ) -> Result<Arc<RelayConnection<P>>> {
        let url = normalize_relay_url(url)?;
        self.get_or_create_conn(&url).await
    }

    /// Return the live connection for a normalized URL, dialing if needed.
    ///
    /// Dial attempts for one URL are serialized by a per-URL async lock;
    /// other URLs proceed independently.
    async fn get_or_create_conn(&self, url: &str) -> Result<Arc<RelayConnection<P>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        self.validator.check(url).await?;

        if let Some(remaining) = self.health.backoff_remaining(url) {
            return Err(Error::BackoffActive {
                url: url.to_string(),
                remaining,
            });
        }

        if let Some(conn) = self.conns.read().get(url) {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }

        let dial_lock = {
            let mut locks = self.dial_locks.lock();
            Arc::clone(
                locks
                    .entry(url.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _dial_guard = dial_lock.lock().await;

        // Re-check under the dial lock: another caller may have connected
        // while this one waited.
        {
            let mut conns = self.conns.write();
            match conns.get(url) {
                Some(conn) if !conn.is_closed() => return Ok(Arc::clone(conn)),
                Some(_) => {
                    conns.remove(url);
                }
                None => {}
            }

            if conns.len() >= self.config.eviction_threshold {
                self.evict_lru(&mut conns);
            }
            if conns.len() >= self.config.max_connections {
                counter!("relay_pool_connect_failures_total", "reason" => "pool-full")
                    .increment(1);
                return Err(Error::PoolFull {
                    count: conns.len(),
                    max: self.config.max_connections,
                });
            }
        }

        let started = Instant::now();
        let conn = match RelayConnection::dial(
            url,
            &self.config,
            Arc::clone(&self.parser),
            Arc::clone(&self.write_only),
            Arc::clone(&self.dropped_events),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.health.record_failure(url);
                counter!("relay_pool_connect_failures_total", "reason" => "dial").increment(1);
                return Err(e);
            }
        };
        self.health.record_success(url);
        self.health.record_response_time(url, started.elapsed());

        // Concurrent dials to other URLs may have filled the pool while the
        // socket was being opened; the ceiling must hold at insert time too.
        let count = {
            let mut conns = self.conns.write();
            if conns.len() >= self.config.max_connections {
                self.evict_lru(&mut conns);
            }
            if conns.len() >= self.config.max_connections {
                conn.teardown("pool-full");
                counter!("relay_pool_connect_failures_total", "reason" => "pool-full")
                    .increment(1);
                return Err(Error::PoolFull {
                    count: conns.len(),
                    max: self.config.max_connections,
                });
            }
            conns.insert(url.to_string(), Arc::clone(&conn));
            conns.len()
        };
        gauge!("relay_pool_connections").set(count as f64);
        Ok(conn)
    }

    /// Evict closed and idle connections down to the target headroom.
    ///
    /// Ranking: closed connections first, then connections with zero
    /// subscriptions idle past the minimum, by oldest activity. A
    /// connection with any active subscription is never evicted.
    fn evict_lru(&self, conns: &mut HashMap<String, Arc<RelayConnection<P>>>) -> bool {
        let target = self
            .config
            .max_connections
            .saturating_sub(self.config.eviction_target_free);

        let mut candidates: Vec<(String, Arc<RelayConnection<P>>, bool, bool, Instant)> = conns
            .iter()
            .map(|(url, conn)| {
                let closed = conn.is_closed();
                let idle = conn.subscription_count() == 0
                    && conn.last_activity().elapsed() >= self.config.min_idle_for_eviction;
                (url.clone(), Arc::clone(conn), closed, idle, conn.last_activity())
            })
            .filter(|(_, _, closed, idle, _)| *closed || *idle)
            .collect();
        candidates.sort_by_key(|(_, _, closed, idle, last_activity)| {
            (!*closed, !*idle, *last_activity)
        });

        let mut evicted = 0usize;
        for (url, conn, ..) in candidates {
            if conns.len() <= target {
                break;
            }
            conn.teardown("evicted");
            conns.remove(&url);
            evicted += 1;
            debug!(url = %url, "evicted idle relay connection");
        }
        evicted > 0
    }

    /// Remove a connection entry if it is still this exact (closed) one.
    fn remove_conn_if_same(&self, url: &str, conn: &Arc<RelayConnection<P>>) {
        let mut conns = self.conns.write();
        if let Some(existing) = conns.get(url) {
            if Arc::ptr_eq(existing, conn) && existing.is_closed() {
                conns.remove(url);
            }
        }
    }

    /// Reap connections that are closed or idle past the cleanup
    /// threshold. Two passes: snapshot under the read lock, mutate under
    /// the write lock.
    fn cleanup_idle(&self) {
        let stale: Vec<(String, Arc<RelayConnection<P>>)> = {
            let conns = self.conns.read();
            conns
                .iter()
                .filter(|(_, conn)| {
                    conn.is_closed()
                        || (conn.subscription_count() == 0
                            && conn.last_activity().elapsed() > self.config.idle_cleanup_threshold)
                })
                .map(|(url, conn)| (url.clone(), Arc::clone(conn)))
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        let mut conns = self.conns.write();
        for (url, conn) in stale {
            let still_stale = match conns.get(&url) {
                Some(existing) if Arc::ptr_eq(existing, &conn) => {
                    conn.is_closed()
                        || (conn.subscription_count() == 0
                            && conn.last_activity().elapsed() > self.config.idle_cleanup_threshold)
                }
                _ => false,
            };
            if still_stale {
                conn.teardown("idle");
                conns.remove(&url);
                debug!(url = %url, "reaped idle relay connection");
            }
        }
        gauge!("relay_pool_connections").set(conns.len() as f64);
    }

    async fn sweep_loop(pool: Weak<Self>, shutdown: CancellationToken, period: Duration) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            let Some(pool) = pool.upgrade() else { return };
            pool.cleanup_idle();
            let expired = pool.validator.dns().sweep_expired();
            if expired > 0 {
                debug!(expired, "swept expired DNS entries");
            }
            pool.write_only.sweep_expired();
        }
    }
}

/// Deregisters a pending-publish waiter when the publish future ends,
/// including when the caller drops it mid-wait.
struct PublishGuard<'a, P: EventParser> {
    conn: &'a Arc<RelayConnection<P>>,
    event_id: &'a str,
}

impl<P: EventParser> Drop for PublishGuard<'_, P> {
    fn drop(&mut self) {
        self.conn.deregister_publish(self.event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_queue_capacity_clamping() {
        assert_eq!(queue_capacity(&json!({})), 50);
        assert_eq!(queue_capacity(&json!({"limit": 10})), 50);
        assert_eq!(queue_capacity(&json!({"limit": 100})), 200);
        assert_eq!(queue_capacity(&json!({"limit": 5000})), 500);
    }

    #[test]
    fn test_req_unsupported_phrases() {
        assert!(WriteOnlyCache::req_unsupported(
            "restricted: this relay does not accept REQ messages"
        ));
        assert!(WriteOnlyCache::req_unsupported("REQ not supported here"));
        assert!(WriteOnlyCache::req_unsupported(
            "subscriptions are not allowed"
        ));
        assert!(WriteOnlyCache::req_unsupported("this is a write-only relay"));
        assert!(!WriteOnlyCache::req_unsupported("rate limited, slow down"));
    }

    #[test]
    fn test_write_only_static_and_detected() {
        let mut statics = HashSet::new();
        statics.insert("wss://blast.example.com".to_string());
        let cache = WriteOnlyCache::new(Duration::from_secs(3600), statics);

        assert!(cache.is_write_only("wss://blast.example.com"));
        assert!(!cache.is_write_only("wss://relay.example.com"));

        cache.mark("wss://relay.example.com");
        assert!(cache.is_write_only("wss://relay.example.com"));
    }

    #[test]
    fn test_write_only_marking_expires() {
        let cache = WriteOnlyCache::new(Duration::ZERO, HashSet::new());
        cache.mark("wss://relay.example.com");
        assert!(!cache.is_write_only("wss://relay.example.com"));

        cache.sweep_expired();
        assert!(cache.detected.lock().is_empty());
    }
}
