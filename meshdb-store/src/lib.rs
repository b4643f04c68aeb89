//! # meshdb Store
//!
//! The node-local half of meshdb: the in-memory document map with its
//! crash-safe persistence, plus the machinery that observes it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        meshdb-store                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  Write path:                                                 │
//! │  ┌─────────┐   ┌───────┐   ┌──────────────┐   ┌──────────┐   │
//! │  │ mutation│──>│ index │──>│ in-memory map│──>│ file+WAL │   │
//! │  └─────────┘   └───────┘   └──────┬───────┘   └──────────┘   │
//! │                                   │ post-commit              │
//! │                                   ▼                          │
//! │                             ┌──────────┐                     │
//! │                             │ event bus│──> replication,     │
//! │                             └──────────┘    websockets,      │
//! │                                             cache invalidate │
//! │                                                              │
//! │  Background: cache sweeper · memory sweeper · auto-backup    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store is the only mutator of the map. Remote (gossip) writes come in
//! through a dedicated apply path that skips the gossip fan-out.

pub mod backup;
pub mod cache;
pub mod events;
pub mod index;
pub mod memory;
pub mod persistence;
pub mod store;
pub mod wal;

pub use cache::{Cache, CacheConfig, CacheStats, EvictionPolicy};
pub use events::{EventBus, EventOrigin, PendingGossip, StoreEvent};
pub use index::{IndexInfo, IndexKind, IndexManager};
pub use memory::{MemoryManager, MemoryManagerConfig, MemoryStats};
pub use persistence::PersistenceManager;
pub use store::{RemoteOutcome, Store, StoreStats};
pub use wal::{TransactionLog, WalEntry};
