//! # meshdb Replication Layer
//!
//! Keeps a swarm of peers approximately convergent on one document map.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          meshdb-net                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  store events ──> outbound queue ──> publish "db-sync"         │
//! │                                                                │
//! │  "db-sync" ──> origin filter ──> LWW apply (store back-door)   │
//! │                                                                │
//! │  timers ──> "sync_request" ──> peer streams "sync_response"    │
//! │             batches back, LWW-applied like gossip              │
//! │                                                                │
//! │  transports: libp2p (gossipsub+mDNS+Kademlia) | in-memory hub  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Convergence is last-writer-wins on `updated_at`, ties broken toward the
//! lexicographically lower peer id. Outbound failures never undo local
//! writes; the local store is this node's source of truth.

pub mod compression;
pub mod envelope;
pub mod memory;
pub mod node;
pub mod replicator;
pub mod swarm;
pub mod sync;
pub mod transport;

pub use envelope::{
    GossipMessage, SyncKind, SyncRequest, SyncResponse, GOSSIP_TOPIC, SYNC_REQUEST_TOPIC,
    SYNC_RESPONSE_TOPIC,
};
pub use memory::{MemoryHub, MemoryTransport};
pub use node::MeshNode;
pub use replicator::Replicator;
pub use swarm::{P2pConfig, P2pTransport};
pub use sync::{SyncConfig, SyncManager, SyncStats};
pub use transport::{NodeId, PeerTransport, TransportMessage};
