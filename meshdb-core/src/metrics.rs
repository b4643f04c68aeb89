//! # Metrics
//!
//! Node-wide operation counters. Cheap atomics, cloned freely.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Store metrics
    documents_created: AtomicU64,
    documents_updated: AtomicU64,
    documents_deleted: AtomicU64,
    queries_executed: AtomicU64,

    // Persistence metrics
    wal_appends: AtomicU64,
    wal_bytes: AtomicU64,
    persistence_errors: AtomicU64,

    // Replication metrics
    gossip_published: AtomicU64,
    gossip_received: AtomicU64,
    gossip_dropped: AtomicU64,
    remote_applied: AtomicU64,
    remote_skipped: AtomicU64,
}

/// Point-in-time snapshot, serializable for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub documents_created: u64,
    pub documents_updated: u64,
    pub documents_deleted: u64,
    pub queries_executed: u64,
    pub wal_appends: u64,
    pub wal_bytes: u64,
    pub persistence_errors: u64,
    pub gossip_published: u64,
    pub gossip_received: u64,
    pub gossip_dropped: u64,
    pub remote_applied: u64,
    pub remote_skipped: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create(&self) {
        self.inner.documents_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.inner.documents_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.inner.documents_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.inner.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_append(&self, bytes: u64) {
        self.inner.wal_appends.fetch_add(1, Ordering::Relaxed);
        self.inner.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_persistence_error(&self) {
        self.inner.persistence_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gossip_published(&self) {
        self.inner.gossip_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gossip_received(&self) {
        self.inner.gossip_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gossip_dropped(&self) {
        self.inner.gossip_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_applied(&self) {
        self.inner.remote_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_skipped(&self) {
        self.inner.remote_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let m = &self.inner;
        MetricsSnapshot {
            documents_created: m.documents_created.load(Ordering::Relaxed),
            documents_updated: m.documents_updated.load(Ordering::Relaxed),
            documents_deleted: m.documents_deleted.load(Ordering::Relaxed),
            queries_executed: m.queries_executed.load(Ordering::Relaxed),
            wal_appends: m.wal_appends.load(Ordering::Relaxed),
            wal_bytes: m.wal_bytes.load(Ordering::Relaxed),
            persistence_errors: m.persistence_errors.load(Ordering::Relaxed),
            gossip_published: m.gossip_published.load(Ordering::Relaxed),
            gossip_received: m.gossip_received.load(Ordering::Relaxed),
            gossip_dropped: m.gossip_dropped.load(Ordering::Relaxed),
            remote_applied: m.remote_applied.load(Ordering::Relaxed),
            remote_skipped: m.remote_skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_create();
        metrics.record_create();
        metrics.record_wal_append(128);

        let snap = metrics.snapshot();
        assert_eq!(snap.documents_created, 2);
        assert_eq!(snap.wal_appends, 1);
        assert_eq!(snap.wal_bytes, 128);
    }
}
