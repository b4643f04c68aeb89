//! The gossip replicator: every local mutation out, every peer mutation in.
//!
//! Outbound: an event-bus callback enqueues envelopes on a bounded
//! drop-oldest queue (the mutator never blocks on the network); a publisher
//! worker drains it with a per-publish timeout. Failures are logged; a
//! committed local write is never rolled back.
//!
//! Inbound: messages authored by this node are ignored; everything else
//! goes through the store's last-writer-wins apply path, which notifies
//! local subscribers without re-entering the gossip fan-out.

use crate::envelope::{GossipMessage, GOSSIP_TOPIC};
use crate::transport::PeerTransport;
use bytes::Bytes;
use meshdb_core::metrics::Metrics;
use meshdb_core::Operation;
use meshdb_store::{EventOrigin, PendingGossip, Store};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_CAPACITY: usize = 1024;

/// Bounded FIFO between the mutator path and the publisher worker. When
/// full, the oldest envelope is dropped and logged.
struct OutboundQueue {
    buffer: Mutex<VecDeque<GossipMessage>>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Non-blocking enqueue; returns the envelope displaced by overflow.
    fn push(&self, message: GossipMessage) -> Option<GossipMessage> {
        let dropped = {
            let mut buffer = self.buffer.lock();
            let dropped = if buffer.len() >= self.capacity {
                buffer.pop_front()
            } else {
                None
            };
            buffer.push_back(message);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<GossipMessage> {
        self.buffer.lock().pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

pub struct Replicator {
    store: Arc<Store>,
    transport: Arc<dyn PeerTransport>,
    queue: Arc<OutboundQueue>,
    pending: PendingGossip,
    metrics: Metrics,
}

impl Replicator {
    pub fn new(store: Arc<Store>, transport: Arc<dyn PeerTransport>) -> Self {
        let pending = store.pending_gossip();
        let metrics = store.metrics();
        Self {
            store,
            transport,
            queue: Arc::new(OutboundQueue::new(OUTBOUND_CAPACITY)),
            pending,
            metrics,
        }
    }

    /// Wire the replicator in: register the outbound event callback,
    /// start the publisher worker and the inbound apply loop.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> meshdb_core::Result<Vec<tokio::task::JoinHandle<()>>> {
        self.register_outbound();
        let publisher = self.spawn_publisher(shutdown.clone());
        let inbound = self.spawn_inbound(shutdown).await?;
        Ok(vec![publisher, inbound])
    }

    /// Gossip the entire document map, e.g. after joining a fresh swarm.
    pub fn announce_all(&self) {
        for collection in self.store.collections() {
            for doc in self.store.get_all(&collection) {
                self.pending.mark(&doc.id);
                if let Some(dropped) = self.queue.push(GossipMessage::create(doc)) {
                    self.drop_envelope(dropped);
                }
            }
        }
    }

    fn register_outbound(self: &Arc<Self>) {
        let queue = self.queue.clone();
        let pending = self.pending.clone();
        let metrics = self.metrics.clone();

        self.store.register_event_callback(move |event| {
            // Remote applies must not loop back into the swarm.
            if event.origin != EventOrigin::Local {
                return;
            }
            let message = match event.op {
                Operation::Create | Operation::Update => match event.document {
                    Some(doc) => {
                        pending.mark(&doc.id);
                        if event.op == Operation::Create {
                            GossipMessage::create(doc)
                        } else {
                            GossipMessage::update(doc)
                        }
                    }
                    None => return,
                },
                Operation::Delete => GossipMessage::delete(event.id),
            };
            if let Some(dropped) = queue.push(message) {
                metrics.record_gossip_dropped();
                pending.clear(dropped.doc_id().unwrap_or_default());
                warn!("outbound gossip queue full; dropped oldest envelope");
            }
        });
    }

    fn spawn_publisher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                while let Some(message) = this.queue.pop() {
                    this.publish_one(message).await;
                }
                tokio::select! {
                    _ = this.queue.wait() => {}
                    _ = shutdown.changed() => {
                        debug!("gossip publisher shutting down");
                        return;
                    }
                }
            }
        })
    }

    async fn publish_one(&self, message: GossipMessage) {
        let id = message.doc_id().unwrap_or_default().to_string();
        let data = match serde_json::to_vec(&message) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!(error = %e, "failed to serialize gossip envelope");
                self.pending.clear(&id);
                return;
            }
        };

        let publish = self.transport.publish(GOSSIP_TOPIC, data);
        match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Ok(Ok(())) => {
                self.metrics.record_gossip_published();
                debug!(id, op = %message.operation, "gossiped mutation");
            }
            Ok(Err(e)) => {
                self.metrics.record_gossip_dropped();
                warn!(id, error = %e, "gossip publish failed; local write stands");
            }
            Err(_) => {
                self.metrics.record_gossip_dropped();
                warn!(id, "gossip publish timed out; local write stands");
            }
        }
        self.pending.clear(&id);
    }

    async fn spawn_inbound(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> meshdb_core::Result<tokio::task::JoinHandle<()>> {
        let mut rx = self.transport.subscribe(GOSSIP_TOPIC).await?;
        let this = self.clone();

        Ok(tokio::spawn(async move {
            let self_id = this.transport.self_id();
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some(message) = message else {
                            debug!("gossip subscription closed");
                            return;
                        };
                        if message.source == self_id {
                            continue;
                        }
                        this.apply_inbound(&message.source, &message.data, &self_id);
                    }
                    _ = shutdown.changed() => {
                        debug!("gossip inbound loop shutting down");
                        return;
                    }
                }
            }
        }))
    }

    fn apply_inbound(&self, source: &str, data: &[u8], self_id: &str) {
        self.metrics.record_gossip_received();

        let message: GossipMessage = match serde_json::from_slice(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(source, error = %e, "ignoring unparseable gossip envelope");
                return;
            }
        };

        match message.operation {
            Operation::Create | Operation::Update => {
                let Some(doc) = message.document else {
                    warn!(source, "gossip create/update without a document");
                    return;
                };
                let id = doc.id.clone();
                match self.store.apply_remote_upsert(doc, source, self_id) {
                    Ok(outcome) => debug!(source, id, ?outcome, "applied gossip"),
                    Err(e) => warn!(source, id, error = %e, "failed to apply gossip"),
                }
            }
            Operation::Delete => {
                let Some(id) = message.document_id else {
                    warn!(source, "gossip delete without an id");
                    return;
                };
                match self.store.apply_remote_delete(&id) {
                    Ok(removed) => debug!(source, id, removed, "applied gossip delete"),
                    Err(e) => warn!(source, id, error = %e, "failed to apply gossip delete"),
                }
            }
        }
    }

    fn drop_envelope(&self, dropped: GossipMessage) {
        self.metrics.record_gossip_dropped();
        self.pending.clear(dropped.doc_id().unwrap_or_default());
        warn!("outbound gossip queue full; dropped oldest envelope");
    }
}
