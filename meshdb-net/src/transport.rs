//! The peer transport seam.
//!
//! The replicator only needs topic-scoped best-effort multicast with a
//! stable per-node identity. The libp2p swarm is one implementation; the
//! in-memory hub used by tests is another.

use async_trait::async_trait;
use bytes::Bytes;
use meshdb_core::Result;
use tokio::sync::mpsc;

/// Display form of a transport-layer peer identity.
pub type NodeId = String;

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// The peer that authored the message.
    pub source: NodeId,
    pub data: Bytes,
}

/// Topic-scoped pub/sub with per-node identity.
///
/// Implementations deliver published messages to every *other* subscriber
/// of the topic, best-effort: no ordering or delivery guarantee across
/// peers. A node never receives its own messages.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<TransportMessage>>;

    fn self_id(&self) -> NodeId;

    /// Currently connected peers.
    fn peers(&self) -> Vec<NodeId>;
}
