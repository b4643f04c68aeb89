//! Event bus: bounded broadcast of committed mutations.
//!
//! Every successful mutation is published exactly once. Each registered
//! callback gets its own worker task fed from a broadcast receiver, so a
//! slow or panicking callback never blocks the mutator: a worker that
//! falls behind loses the oldest events (logged), not the newest.

use meshdb_core::{Document, Operation};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Where a mutation originated. Remote events come from the replication
/// apply path and must not be gossiped again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Remote,
}

/// A committed mutation, as observed by subscribers.
///
/// `document` is the post-state for create/update and a snapshot of the
/// deleted document for delete.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub op: Operation,
    pub collection: String,
    pub id: String,
    pub document: Option<Document>,
    pub origin: EventOrigin,
}

/// Bounded-buffer broadcaster.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. A bus with no subscribers
    /// swallows the event, which is fine: nobody asked.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }

    /// Raw subscription, for consumers that manage their own loop
    /// (replicator outbound, WebSocket sessions).
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Register a callback on its own worker task. The callback sees
    /// mutations in commit order; panics are caught and logged without
    /// unregistering it.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(StoreEvent) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let result = catch_unwind(AssertUnwindSafe(|| callback(event)));
                        if result.is_err() {
                            error!("event callback panicked; skipping event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "event callback fell behind; dropping oldest events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Document ids queued for outbound gossip but not yet published. The
/// memory sweeper consults this set: such documents must stay in memory.
#[derive(Clone, Default)]
pub struct PendingGossip {
    inner: Arc<parking_lot::Mutex<std::collections::HashSet<String>>>,
}

impl PendingGossip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: &str) {
        self.inner.lock().insert(id.to_string());
    }

    pub fn clear(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(op: Operation, id: &str) -> StoreEvent {
        StoreEvent {
            op,
            collection: "users".to_string(),
            id: id.to_string(),
            document: None,
            origin: EventOrigin::Local,
        }
    }

    #[tokio::test]
    async fn every_listener_sees_every_event_once() {
        let bus = EventBus::new(16);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c = first.clone();
        bus.register_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = second.clone();
        bus.register_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // Give the workers a moment to subscribe-and-park.
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..5 {
            bus.publish(event(Operation::Create, &format!("doc-{i}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first.load(Ordering::SeqCst), 5);
        assert_eq!(second.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn a_panicking_callback_stays_registered() {
        let bus = EventBus::new(16);
        let seen = Arc::new(AtomicUsize::new(0));

        let c = seen.clone();
        bus.register_callback(move |event| {
            if event.id == "boom" {
                panic!("callback exploded");
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(event(Operation::Create, "ok-1"));
        bus.publish(event(Operation::Create, "boom"));
        bus.publish(event(Operation::Create, "ok-2"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_gossip_tracks_ids() {
        let pending = PendingGossip::new();
        assert!(pending.is_empty());
        pending.mark("a");
        pending.mark("a");
        assert!(pending.contains("a"));
        assert_eq!(pending.len(), 1);
        pending.clear("a");
        assert!(!pending.contains("a"));
    }
}
