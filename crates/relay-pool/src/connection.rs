//! A single supervised WebSocket connection to one relay.
//!
//! Each connection owns exactly one reader (its read loop) and one
//! keepalive task. Writes from any caller are serialized by an async lock
//! on the sink; mutable state (subscription table, pending publishes,
//! activity timestamps) lives behind a separate sync lock that is never
//! held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::WriteOnlyCache;
use crate::protocol::{parse_relay_message, RelayMessage};
use crate::subscription::{subscription_pair, SubscriptionEntry, SubscriptionHandle};
use crate::EventParser;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Relay verdict on a published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub accepted: bool,
    pub message: String,
}

struct ConnState<E> {
    subs: HashMap<String, SubscriptionEntry<E>>,
    pending_publishes: HashMap<String, oneshot::Sender<PublishAck>>,
    last_activity: Instant,
    last_pong: Instant,
    closed: bool,
}

/// One live relay connection plus its two supervision tasks.
pub(crate) struct RelayConnection<P: EventParser> {
    url: String,
    writer: tokio::sync::Mutex<WsSink>,
    state: Mutex<ConnState<P::Event>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    parser: Arc<P>,
    write_only: Arc<WriteOnlyCache>,
    dropped_events: Arc<AtomicU64>,
    config: PoolConfig,
}

impl<P: EventParser> RelayConnection<P> {
    /// Dial the relay and start its read and keepalive loops.
    pub(crate) async fn dial(
        url: &str,
        config: &PoolConfig,
        parser: Arc<P>,
        write_only: Arc<WriteOnlyCache>,
        dropped_events: Arc<AtomicU64>,
    ) -> Result<Arc<Self>> {
        let (ws, _response) = match timeout(config.dial_timeout, connect_async(url)).await {
            Err(_) => {
                return Err(Error::Dial {
                    url: url.to_string(),
                    reason: "handshake timed out".to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(Error::Dial {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(ok)) => ok,
        };

        // Keepalive pings and small frames should not sit in Nagle buffers.
        match ws.get_ref() {
            MaybeTlsStream::Plain(stream) => {
                let _ = stream.set_nodelay(true);
            }
            MaybeTlsStream::Rustls(tls) => {
                let _ = tls.get_ref().0.set_nodelay(true);
            }
            _ => {}
        }

        let (sink, source) = ws.split();
        let now = Instant::now();
        let conn = Arc::new(Self {
            url: url.to_string(),
            writer: tokio::sync::Mutex::new(sink),
            state: Mutex::new(ConnState {
                subs: HashMap::new(),
                pending_publishes: HashMap::new(),
                last_activity: now,
                last_pong: now,
                closed: false,
            }),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::with_capacity(2)),
            parser,
            write_only,
            dropped_events,
            config: config.clone(),
        });

        let reader = tokio::spawn(Arc::clone(&conn).read_loop(source));
        let keepalive = tokio::spawn(Arc::clone(&conn).keepalive_loop());
        conn.tasks.lock().extend([reader, keepalive]);

        counter!("relay_pool_connects_total").increment(1);
        debug!(url, "relay connected");
        Ok(conn)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.state.lock().subs.len()
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    /// Send one text frame under the write deadline.
    pub(crate) async fn send_text(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(self.config.write_timeout, writer.send(Message::Text(text.into()))).await {
            Err(_) => Err(Error::WriteTimeout {
                url: self.url.clone(),
            }),
            Ok(Err(e)) => Err(Error::WebSocket(e.to_string())),
            Ok(Ok(())) => {
                self.state.lock().last_activity = Instant::now();
                Ok(())
            }
        }
    }

    /// Register a subscription, yielding the caller's handle.
    pub(crate) fn register_subscription(
        &self,
        sub_id: &str,
        queue_capacity: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<SubscriptionHandle<P::Event>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed {
                url: self.url.clone(),
            });
        }
        if state.subs.contains_key(sub_id) {
            return Err(Error::DuplicateSubscription {
                url: self.url.clone(),
                sub_id: sub_id.to_string(),
            });
        }
        let (entry, handle) = subscription_pair(sub_id, &self.url, queue_capacity, permit);
        state.subs.insert(sub_id.to_string(), entry);
        Ok(handle)
    }

    /// Remove and close a subscription. Returns whether it existed.
    pub(crate) fn remove_subscription(&self, sub_id: &str) -> bool {
        let entry = self.state.lock().subs.remove(sub_id);
        match entry {
            Some(entry) => {
                entry.close();
                true
            }
            None => false,
        }
    }

    /// Register a pending-publish waiter for an event ID.
    ///
    /// A second publish of the same ID on one connection replaces the
    /// first waiter, failing it.
    pub(crate) fn register_publish(&self, event_id: &str) -> Result<oneshot::Receiver<PublishAck>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed {
                url: self.url.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.pending_publishes.insert(event_id.to_string(), tx);
        Ok(rx)
    }

    pub(crate) fn deregister_publish(&self, event_id: &str) {
        self.state.lock().pending_publishes.remove(event_id);
    }

    /// Close the connection and fail every dependent.
    ///
    /// Idempotent. Every subscription is closed and every pending-publish
    /// waiter is dropped (its receiver observes a closed channel). The
    /// read and keepalive loops observe the shutdown token and exit.
    pub(crate) fn teardown(&self, reason: &'static str) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for (_, entry) in state.subs.drain() {
                entry.close();
            }
            state.pending_publishes.clear();
        }
        self.shutdown.cancel();
        counter!("relay_pool_disconnects_total", "reason" => reason).increment(1);
        debug!(url = %self.url, reason, "relay connection torn down");
    }

    /// Tear down and wait for both supervision tasks to finish.
    pub(crate) async fn shutdown_and_join(&self) {
        self.teardown("shutdown");
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource) {
        let reason = loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break "shutdown",
                read = timeout(self.config.read_deadline, source.next()) => read,
            };
            match message {
                Err(_) => break "read-deadline",
                Ok(None) => break "stream-end",
                Ok(Some(Err(e))) => {
                    debug!(url = %self.url, error = %e, "read error");
                    break "read-error";
                }
                Ok(Some(Ok(Message::Text(text)))) => self.handle_frame(text.as_str()),
                Ok(Some(Ok(Message::Ping(payload)))) => {
                    let reply = async {
                        let mut writer = self.writer.lock().await;
                        writer.send(Message::Pong(payload)).await
                    };
                    match timeout(self.config.write_timeout, reply).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => break "write-error",
                    }
                }
                Ok(Some(Ok(Message::Pong(_)))) => {
                    let mut state = self.state.lock();
                    state.last_pong = Instant::now();
                    state.last_activity = state.last_pong;
                }
                Ok(Some(Ok(Message::Close(_)))) => break "peer-close",
                Ok(Some(Ok(_))) => {}
            }
        };
        self.teardown(reason);
    }

    /// Dispatch one inbound text frame. Never blocks the reader: event
    /// delivery is try-send with drop-on-overflow, signals are single-slot.
    fn handle_frame(&self, text: &str) {
        let Some(message) = parse_relay_message(text) else {
            trace!(url = %self.url, "skipping unrecognized frame");
            return;
        };

        let mut state = self.state.lock();
        state.last_activity = Instant::now();

        match message {
            RelayMessage::Event { sub_id, event } => {
                let Some(parsed) = self.parser.parse(&event) else {
                    return;
                };
                let Some(entry) = state.subs.get(&sub_id) else {
                    return;
                };
                use tokio::sync::mpsc::error::TrySendError;
                match entry.sender.try_send(parsed) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.dropped_events.fetch_add(1, Ordering::Relaxed);
                        counter!("relay_pool_events_dropped_total").increment(1);
                        trace!(url = %self.url, sub_id, "event queue full, dropping event");
                    }
                    Err(TrySendError::Closed(_)) => {
                        if let Some(entry) = state.subs.remove(&sub_id) {
                            entry.close();
                        }
                    }
                }
            }
            RelayMessage::Eose { sub_id } => {
                if let Some(entry) = state.subs.get(&sub_id) {
                    entry.eose.send_replace(true);
                }
            }
            RelayMessage::Closed { sub_id, reason } => {
                debug!(url = %self.url, sub_id, reason, "subscription closed by relay");
                if let Some(entry) = state.subs.remove(&sub_id) {
                    entry.close();
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                if let Some(waiter) = state.pending_publishes.remove(&event_id) {
                    let _ = waiter.send(PublishAck { accepted, message });
                }
            }
            RelayMessage::Notice { text } => {
                debug!(url = %self.url, notice = %text, "relay notice");
                if WriteOnlyCache::req_unsupported(&text) {
                    drop(state);
                    self.write_only.mark(&self.url);
                    warn!(url = %self.url, "relay marked write-only from notice");
                }
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let pong_age = {
                let state = self.state.lock();
                if state.closed {
                    return;
                }
                state.last_pong.elapsed()
            };
            if pong_age > self.config.pong_timeout {
                warn!(url = %self.url, ?pong_age, "no pong, declaring connection dead");
                self.teardown("pong-timeout");
                return;
            }

            let ping = async {
                let mut writer = self.writer.lock().await;
                writer.send(Message::Ping(Bytes::new())).await
            };
            match timeout(self.config.write_timeout, ping).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    self.teardown("ping-failed");
                    return;
                }
            }
        }
    }
}
