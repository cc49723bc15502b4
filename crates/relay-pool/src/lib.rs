//! Shared connection pool for Nostr relays.
//!
//! Maintains at most one supervised WebSocket per relay URL and
//! multiplexes subscriptions and publishes from many concurrent callers
//! over it. Connections are dialed lazily, validated against an SSRF
//! policy first, health-scored, kept alive with pings, and reclaimed by
//! LRU eviction and idle sweeping when the pool fills up.
//!
//! ```text
//!                         RelayPool
//!   subscribe ──┐   ┌──────────────────────┐
//!   publish ────┼──▶│ conn map (1 per URL) │──▶ RelayConnection ══▶ relay A
//!   unsubscribe ┘   │ dial locks / slots   │──▶ RelayConnection ══▶ relay B
//!                   │ safety + DNS cache   │         │  │
//!                   │ health tracker       │     read loop (1)
//!                   │ write-only cache     │     keepalive loop
//!                   │ idle sweeper task    │
//!                   └──────────────────────┘
//! ```
//!
//! Inbound `EVENT` frames flow through a caller-supplied [`EventParser`]
//! into each subscription's bounded queue; on overflow the newest event is
//! dropped rather than blocking the connection's reader.

pub mod config;
pub mod error;

mod connection;
mod dns;
mod health;
mod pool;
mod protocol;
mod safety;
mod subscription;
mod url;

pub use config::{HealthConfig, PoolConfig};
pub use connection::PublishAck;
pub use error::{Error, Result};
pub use health::{RelayHealthDetail, RelayHealthStats};
pub use pool::RelayPool;
pub use subscription::SubscriptionHandle;
pub use url::normalize_relay_url;

/// Turns raw relay event JSON into the caller's event type.
///
/// Parse failures are skipped silently; a malformed event from one relay
/// is not a protocol error.
pub trait EventParser: Send + Sync + 'static {
    type Event: Send + 'static;

    fn parse(&self, raw: &serde_json::Value) -> Option<Self::Event>;
}

/// Pass-through parser delivering events as raw JSON values.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventParser;

impl EventParser for JsonEventParser {
    type Event = serde_json::Value;

    fn parse(&self, raw: &serde_json::Value) -> Option<Self::Event> {
        Some(raw.clone())
    }
}
