//! In-process transport for tests: a hub that fans published messages out
//! to every other subscriber of the topic, like a one-hop gossip mesh.

use crate::transport::{NodeId, PeerTransport, TransportMessage};
use async_trait::async_trait;
use bytes::Bytes;
use meshdb_core::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

struct Subscriber {
    node: NodeId,
    sender: mpsc::Sender<TransportMessage>,
}

#[derive(Default)]
struct HubInner {
    topics: HashMap<String, Vec<Subscriber>>,
    nodes: Vec<NodeId>,
    /// (node, topic) -> number of messages published. Tests assert on this
    /// to prove gossip loops are suppressed.
    published: HashMap<(NodeId, String), u64>,
}

/// Shared bus connecting in-memory transports.
#[derive(Default)]
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport endpoint attached to this hub.
    pub fn transport(self: &Arc<Self>, node_id: &str) -> MemoryTransport {
        self.inner.lock().nodes.push(node_id.to_string());
        MemoryTransport {
            hub: self.clone(),
            node_id: node_id.to_string(),
        }
    }

    /// How many messages `node` has published on `topic`.
    pub fn published_count(&self, node_id: &str, topic: &str) -> u64 {
        self.inner
            .lock()
            .published
            .get(&(node_id.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    node_id: NodeId,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        let targets: Vec<mpsc::Sender<TransportMessage>> = {
            let mut inner = self.hub.inner.lock();
            *inner
                .published
                .entry((self.node_id.clone(), topic.to_string()))
                .or_insert(0) += 1;
            inner
                .topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| s.node != self.node_id)
                        .map(|s| s.sender.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        let message = TransportMessage {
            source: self.node_id.clone(),
            data,
        };
        for target in targets {
            if target.send(message.clone()).await.is_err() {
                warn!(topic, "memory transport subscriber went away");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<TransportMessage>> {
        let (tx, rx) = mpsc::channel(1024);
        self.hub
            .inner
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                node: self.node_id.clone(),
                sender: tx,
            });
        Ok(rx)
    }

    fn self_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.hub
            .inner
            .lock()
            .nodes
            .iter()
            .filter(|n| *n != &self.node_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_reach_other_subscribers_only() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-a");
        let b = hub.transport("node-b");

        let mut a_rx = a.subscribe("t").await.unwrap();
        let mut b_rx = b.subscribe("t").await.unwrap();

        a.publish("t", Bytes::from_static(b"hello")).await.unwrap();

        let got = b_rx.recv().await.unwrap();
        assert_eq!(got.source, "node-a");
        assert_eq!(&got.data[..], b"hello");

        // The author never hears itself.
        assert!(a_rx.try_recv().is_err());
        assert_eq!(hub.published_count("node-a", "t"), 1);
    }

    #[tokio::test]
    async fn peers_lists_everyone_else() {
        let hub = MemoryHub::new();
        let a = hub.transport("node-a");
        let _b = hub.transport("node-b");
        let _c = hub.transport("node-c");

        let mut peers = a.peers();
        peers.sort();
        assert_eq!(peers, vec!["node-b".to_string(), "node-c".to_string()]);
        assert_eq!(a.self_id(), "node-a");
    }
}
