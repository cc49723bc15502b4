//! Subscription plumbing between a connection's read loop and the caller.
//!
//! Each subscription is a bounded event queue plus two signals: a
//! single-slot EOSE flag (overwrite-or-drop, never blocking the reader)
//! and an idempotent close token. The connection holds the sending half,
//! the caller holds a [`SubscriptionHandle`].

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;

/// Connection-side half of a subscription.
pub(crate) struct SubscriptionEntry<E> {
    pub(crate) sender: mpsc::Sender<E>,
    pub(crate) eose: watch::Sender<bool>,
    pub(crate) closed: CancellationToken,
    /// Per-relay concurrency permit, released when the entry drops.
    _permit: Option<OwnedSemaphorePermit>,
}

impl<E> SubscriptionEntry<E> {
    /// Mark the subscription closed. Idempotent; wakes the handle even if
    /// events are still queued.
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

/// Caller-side handle to an active subscription.
pub struct SubscriptionHandle<E> {
    id: String,
    relay_url: String,
    events: mpsc::Receiver<E>,
    eose: watch::Receiver<bool>,
    closed: CancellationToken,
}

impl<E> SubscriptionHandle<E> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Receive the next event, or `None` once the subscription is closed.
    ///
    /// Close wins over queued events: a closed subscription stops
    /// delivering immediately rather than draining its queue first.
    pub async fn next_event(&mut self) -> Option<E> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Wait until the relay signals end-of-stored-events.
    ///
    /// Returns `false` if the subscription closes first.
    pub async fn wait_eose(&mut self) -> bool {
        if *self.eose.borrow_and_update() {
            return true;
        }
        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return false,
                changed = self.eose.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    if *self.eose.borrow_and_update() {
                        return true;
                    }
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

// Manual impl: the event type need not be Debug.
impl<E> std::fmt::Debug for SubscriptionHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("relay_url", &self.relay_url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Build a linked entry/handle pair with the given event-queue capacity.
pub(crate) fn subscription_pair<E>(
    id: &str,
    relay_url: &str,
    queue_capacity: usize,
    permit: Option<OwnedSemaphorePermit>,
) -> (SubscriptionEntry<E>, SubscriptionHandle<E>) {
    let (sender, events) = mpsc::channel(queue_capacity);
    let (eose_tx, eose_rx) = watch::channel(false);
    let closed = CancellationToken::new();

    let entry = SubscriptionEntry {
        sender,
        eose: eose_tx,
        closed: closed.clone(),
        _permit: permit,
    };
    let handle = SubscriptionHandle {
        id: id.to_string(),
        relay_url: relay_url.to_string(),
        events,
        eose: eose_rx,
        closed,
    };
    (entry, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_delivery_in_order() {
        let (entry, mut handle) = subscription_pair::<u32>("sub1", "ws://localhost", 8, None);
        entry.sender.try_send(1).unwrap();
        entry.sender.try_send(2).unwrap();

        assert_eq!(handle.next_event().await, Some(1));
        assert_eq!(handle.next_event().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_wins_over_queued_events() {
        let (entry, mut handle) = subscription_pair::<u32>("sub1", "ws://localhost", 8, None);
        entry.sender.try_send(1).unwrap();
        entry.close();

        assert_eq!(handle.next_event().await, None);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_overflow_is_try_send_full() {
        let (entry, _handle) = subscription_pair::<u32>("sub1", "ws://localhost", 2, None);
        entry.sender.try_send(1).unwrap();
        entry.sender.try_send(2).unwrap();
        assert!(matches!(
            entry.sender.try_send(3),
            Err(mpsc::error::TrySendError::Full(3))
        ));
    }

    #[tokio::test]
    async fn test_wait_eose() {
        let (entry, mut handle) = subscription_pair::<u32>("sub1", "ws://localhost", 8, None);
        let waiter = tokio::spawn(async move { handle.wait_eose().await });
        entry.eose.send_replace(true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_eose_false_on_close() {
        let (entry, mut handle) = subscription_pair::<u32>("sub1", "ws://localhost", 8, None);
        let waiter = tokio::spawn(async move { handle.wait_eose().await });
        entry.close();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn test_handle_debug_without_debug_events() {
        struct Opaque;
        let (_entry, handle) = subscription_pair::<Opaque>("sub1", "ws://localhost", 8, None);
        let rendered = format!("{:?}", handle);
        assert!(rendered.contains("sub1"));
        assert!(rendered.contains("closed: false"));
    }

    #[tokio::test]
    async fn test_eose_signal_is_overwrite_not_queue() {
        let (entry, mut handle) = subscription_pair::<u32>("sub1", "ws://localhost", 8, None);
        // Repeated signals collapse into one observation.
        entry.eose.send_replace(true);
        entry.eose.send_replace(true);
        assert!(handle.wait_eose().await);
        assert!(handle.wait_eose().await);
    }
}
