//! Memory manager: keeps the resident document set under configured
//! ceilings.
//!
//! A background loop samples the store's estimated footprint and document
//! count. When a ceiling is crossed it first gzip-packs cold payloads in
//! memory (optional), then evicts the least-recently-accessed documents to
//! disk. Documents with a pending outbound gossip are never touched.

use crate::store::Store;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MemoryManagerConfig {
    /// Estimated-bytes ceiling. Zero disables the byte check.
    pub memory_limit_bytes: usize,
    /// Fraction of the byte ceiling that triggers a cleanup.
    pub cleanup_threshold: f64,
    /// Maximum documents resident in memory. Zero disables the count check.
    pub max_documents: usize,
    pub check_interval: Duration,
    /// Gate for the in-memory compression pass.
    pub enable_compression: bool,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 0,
            cleanup_threshold: 0.8,
            max_documents: 0,
            check_interval: Duration::from_secs(60),
            enable_compression: false,
        }
    }
}

/// Counters exposed over `stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub estimated_bytes: usize,
    pub resident_documents: usize,
    pub cleanup_runs: u64,
    pub documents_packed: u64,
    pub documents_evicted: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

pub struct MemoryManager {
    store: Arc<Store>,
    config: MemoryManagerConfig,
    stats: Mutex<MemoryStats>,
}

impl MemoryManager {
    pub fn new(store: Arc<Store>, config: MemoryManagerConfig) -> Self {
        Self {
            store,
            config,
            stats: Mutex::new(MemoryStats::default()),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let mut stats = self.stats.lock().clone();
        stats.estimated_bytes = self.store.estimated_bytes();
        stats.resident_documents = self.store.in_memory_count();
        stats
    }

    /// Run one check-and-cleanup cycle immediately.
    pub fn force_cleanup(&self) {
        self.cleanup();
    }

    fn over_byte_limit(&self) -> bool {
        if self.config.memory_limit_bytes == 0 {
            return false;
        }
        let threshold =
            (self.config.memory_limit_bytes as f64 * self.config.cleanup_threshold) as usize;
        self.store.estimated_bytes() >= threshold
    }

    fn over_document_limit(&self) -> bool {
        self.config.max_documents > 0
            && self.store.in_memory_count() > self.config.max_documents
    }

    fn check(&self) {
        if self.over_byte_limit() || self.over_document_limit() {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        let mut packed = 0u64;
        let mut evicted = 0u64;

        if self.config.enable_compression {
            // Pack coldest-first until the byte pressure clears.
            let mut candidates = self.coldest_first(self.store.live_ids());
            while self.over_byte_limit() {
                let Some(id) = candidates.pop() else { break };
                match self.store.pack_document(&id) {
                    Ok(true) => packed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(id, error = %e, "failed to pack document"),
                }
            }
        }

        if self.config.max_documents > 0 {
            let mut excess = self
                .store
                .in_memory_count()
                .saturating_sub(self.config.max_documents);
            let mut candidates: Vec<(String, u64)> = self.store.access_snapshot();
            candidates.sort_by_key(|(_, tick)| *tick);

            for (id, _) in candidates {
                if excess == 0 {
                    break;
                }
                match self.store.evict_to_disk(&id) {
                    Ok(true) => {
                        evicted += 1;
                        excess -= 1;
                    }
                    Ok(false) => debug!(id, "skipping eviction (pending gossip or gone)"),
                    Err(e) => warn!(id, error = %e, "failed to evict document"),
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.cleanup_runs += 1;
        stats.documents_packed += packed;
        stats.documents_evicted += evicted;
        stats.last_cleanup = Some(Utc::now());

        if packed > 0 || evicted > 0 {
            info!(packed, evicted, "memory cleanup finished");
        }
    }

    /// Ids ordered hottest-first, so `pop()` yields the coldest.
    fn coldest_first(&self, ids: Vec<String>) -> Vec<String> {
        let snapshot = self.store.access_snapshot();
        let ticks: std::collections::HashMap<&str, u64> = snapshot
            .iter()
            .map(|(id, tick)| (id.as_str(), *tick))
            .collect();
        let mut ids = ids;
        ids.sort_by_key(|id| std::cmp::Reverse(ticks.get(id.as_str()).copied().unwrap_or(0)));
        ids
    }
}

/// Spawn the periodic footprint check.
pub fn spawn_sweeper(
    manager: Arc<MemoryManager>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let period = manager.config.check_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => manager.check(),
                _ = shutdown.changed() => {
                    debug!("memory sweeper shutting down");
                    break;
                }
            }
        }
    })
}
