//! Error types for the relay connection pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing relay connections.
#[derive(Error, Debug)]
pub enum Error {
    /// The URL is not a valid relay URL.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The destination was rejected by the safety validator; never dialed.
    #[error("unsafe destination '{url}': {reason}")]
    UnsafeDestination { url: String, reason: String },

    /// The relay is inside its backoff window; no dial was attempted.
    #[error("relay '{url}' is backed off for another {remaining:?}")]
    BackoffActive { url: String, remaining: Duration },

    /// The relay is known not to accept REQ subscriptions.
    #[error("relay '{url}' is write-only (does not accept REQ)")]
    WriteOnlyRelay { url: String },

    /// Dialing the relay failed.
    #[error("dial failed for '{url}': {reason}")]
    Dial { url: String, reason: String },

    /// The pool is at its hard ceiling and eviction could not free room.
    #[error("connection pool full ({count}/{max})")]
    PoolFull { count: usize, max: usize },

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The connection to the relay is closed.
    #[error("connection to '{url}' is closed")]
    ConnectionClosed { url: String },

    /// Timed out acquiring a per-relay subscription slot.
    #[error("timed out acquiring a subscription slot for '{url}'")]
    SlotTimeout { url: String },

    /// A subscription with this ID is already registered on the connection.
    #[error("subscription '{sub_id}' already active on '{url}'")]
    DuplicateSubscription { url: String, sub_id: String },

    /// A frame write did not complete within the write deadline.
    #[error("write to '{url}' timed out")]
    WriteTimeout { url: String },

    /// The relay did not acknowledge a published event in time.
    #[error("publish of event '{event_id}' timed out")]
    PublishTimeout { event_id: String },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}
