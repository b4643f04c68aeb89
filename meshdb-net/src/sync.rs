//! Periodic resynchronization: the safety net under best-effort gossip.
//!
//! Two timers drive it. The incremental round asks every connected peer
//! for documents modified since the last successful sync with that peer;
//! the full round asks for everything. A responder streams batches bounded
//! by the requested `batch_size` (optionally gzip-compressed), `has_more`
//! set on every batch but the last. Received documents go through the same
//! last-writer-wins path as gossip, so re-delivery is harmless.
//!
//! Everything here is a background worker: errors are counted and logged,
//! never propagated.

use crate::envelope::{
    SyncKind, SyncRequest, SyncResponse, SYNC_REQUEST_TOPIC, SYNC_RESPONSE_TOPIC,
};
use crate::transport::{NodeId, PeerTransport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use meshdb_store::{RemoteOutcome, Store};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub full_interval: Duration,
    pub incremental_interval: Duration,
    pub batch_size: usize,
    pub response_timeout: Duration,
    pub use_compression: bool,
    pub compression_level: u32,
    /// Collections never offered to peers.
    pub excluded_collections: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_interval: Duration::from_secs(24 * 60 * 60),
            incremental_interval: Duration::from_secs(5 * 60),
            batch_size: 100,
            response_timeout: Duration::from_secs(30),
            use_compression: true,
            compression_level: 6,
            excluded_collections: vec!["_system".to_string()],
        }
    }
}

/// Accumulated counters, exposed over the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub full_syncs: u64,
    pub incremental_syncs: u64,
    pub peer_requests_sent: u64,
    pub failed_requests: u64,
    pub documents_sent: u64,
    pub documents_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_duration_ms: u64,
}

#[derive(Default)]
struct SyncState {
    in_progress: bool,
    last_sync_by_peer: HashMap<NodeId, DateTime<Utc>>,
}

pub struct SyncManager {
    store: Arc<Store>,
    transport: Arc<dyn PeerTransport>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    stats: Mutex<SyncStats>,
}

impl SyncManager {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn PeerTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            state: Mutex::new(SyncState::default()),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Start the two resync timers plus the request/response handlers.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> meshdb_core::Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = Vec::new();
        handles.push(self.spawn_timer(SyncKind::Incremental, shutdown.clone()));
        handles.push(self.spawn_timer(SyncKind::Full, shutdown.clone()));
        handles.push(self.spawn_request_handler(shutdown.clone()).await?);
        handles.push(self.spawn_response_handler(shutdown).await?);
        Ok(handles)
    }

    fn spawn_timer(
        self: &Arc<Self>,
        kind: SyncKind,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let period = match kind {
            SyncKind::Full => this.config.full_interval,
            _ => this.config.incremental_interval,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate tick would race node startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.sync_with_peers(kind).await,
                    _ = shutdown.changed() => {
                        debug!(?kind, "resync timer shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// One resync round against every currently connected peer. Public so
    /// operators (and tests) can trigger it on demand.
    pub async fn sync_with_peers(&self, kind: SyncKind) {
        self.run_round(kind, None).await;
    }

    /// Ask the swarm for one collection, since our cursor for each peer.
    pub async fn sync_collection(&self, collection: &str) {
        self.run_round(SyncKind::Collection, Some(collection.to_string()))
            .await;
    }

    async fn run_round(&self, kind: SyncKind, collection: Option<String>) {
        {
            let mut state = self.state.lock();
            if state.in_progress {
                debug!("sync already in progress, skipping round");
                return;
            }
            state.in_progress = true;
        }
        let started = std::time::Instant::now();

        let peers = self.transport.peers();
        if peers.is_empty() {
            self.state.lock().in_progress = false;
            return;
        }

        {
            let mut stats = self.stats.lock();
            stats.total_syncs += 1;
            match kind {
                SyncKind::Full => stats.full_syncs += 1,
                _ => stats.incremental_syncs += 1,
            }
        }

        for peer in peers {
            let last_sync = self.state.lock().last_sync_by_peer.get(&peer).copied();
            let request = SyncRequest {
                node_id: self.transport.self_id(),
                request_type: kind,
                collection: collection.clone(),
                last_sync_time: match kind {
                    SyncKind::Incremental | SyncKind::Collection => last_sync,
                    SyncKind::Full => None,
                },
                batch_size: self.config.batch_size,
                use_compression: self.config.use_compression,
                request_id: Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
            };

            match self.send_request(&request).await {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.last_sync_by_peer.insert(peer.clone(), Utc::now());
                    self.stats.lock().peer_requests_sent += 1;
                }
                Err(e) => {
                    warn!(peer, error = %e, "sync request failed");
                    self.stats.lock().failed_requests += 1;
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.last_sync_time = Some(Utc::now());
        stats.last_sync_duration_ms = started.elapsed().as_millis() as u64;
        drop(stats);
        self.state.lock().in_progress = false;
    }

    async fn send_request(&self, request: &SyncRequest) -> meshdb_core::Result<()> {
        let data = Bytes::from(serde_json::to_vec(request)?);
        let publish = self.transport.publish(SYNC_REQUEST_TOPIC, data);
        tokio::time::timeout(self.config.response_timeout, publish)
            .await
            .map_err(|_| meshdb_core::Error::transport("sync request timed out"))?
    }

    async fn spawn_request_handler(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> meshdb_core::Result<tokio::task::JoinHandle<()>> {
        let mut rx = self.transport.subscribe(SYNC_REQUEST_TOPIC).await?;
        let this = self.clone();

        Ok(tokio::spawn(async move {
            let self_id = this.transport.self_id();
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some(message) = message else { return };
                        let request: SyncRequest = match serde_json::from_slice(&message.data) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(error = %e, "ignoring unparseable sync request");
                                continue;
                            }
                        };
                        if request.node_id == self_id {
                            continue;
                        }
                        this.answer_request(&request).await;
                    }
                    _ = shutdown.changed() => {
                        debug!("sync request handler shutting down");
                        return;
                    }
                }
            }
        }))
    }

    /// Stream the matching documents back in `batch_size` chunks.
    async fn answer_request(&self, request: &SyncRequest) {
        let self_id = self.transport.self_id();
        let documents = match self.collect_documents(request) {
            Ok(documents) => documents,
            Err(e) => {
                let response =
                    SyncResponse::failure(&self_id, &request.request_id, e.to_string());
                self.send_response(&response).await;
                return;
            }
        };

        debug!(
            peer = %request.node_id,
            kind = ?request.request_type,
            count = documents.len(),
            "answering sync request"
        );

        let batch_size = request.batch_size.max(1);
        let total = documents.len();
        let mut sent = 0usize;
        let mut batches: Vec<Vec<_>> = Vec::new();
        let mut current = Vec::new();
        for doc in documents {
            current.push(doc);
            if current.len() == batch_size {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() || batches.is_empty() {
            batches.push(current);
        }

        let last = batches.len() - 1;
        for (i, batch) in batches.into_iter().enumerate() {
            let count = batch.len();
            let response = match SyncResponse::batch(
                &self_id,
                &request.request_id,
                batch,
                i < last,
                request.use_compression,
                self.config.compression_level,
            ) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "failed to build sync batch");
                    return;
                }
            };
            self.send_response(&response).await;
            sent += count;
        }

        self.stats.lock().documents_sent += sent as u64;
        if total > 0 {
            info!(peer = %request.node_id, sent, "sync batches sent");
        }
    }

    fn collect_documents(
        &self,
        request: &SyncRequest,
    ) -> meshdb_core::Result<Vec<meshdb_core::Document>> {
        let collections: Vec<String> = match request.request_type {
            SyncKind::Collection => {
                let name = request.collection.clone().ok_or_else(|| {
                    meshdb_core::Error::malformed("sync request", "collection sync without name")
                })?;
                if self.config.excluded_collections.contains(&name) {
                    return Err(meshdb_core::Error::conflict(format!(
                        "collection {name} is excluded from sync"
                    )));
                }
                vec![name]
            }
            _ => self
                .store
                .collections()
                .into_iter()
                .filter(|c| !self.config.excluded_collections.contains(c))
                .collect(),
        };

        let cutoff = match request.request_type {
            SyncKind::Full => None,
            _ => request.last_sync_time,
        };

        let mut documents = Vec::new();
        for collection in collections {
            for doc in self.store.get_all(&collection) {
                let wanted = cutoff.map(|t| doc.updated_at > t).unwrap_or(true);
                if wanted {
                    documents.push(doc);
                }
            }
        }
        // Oldest first, so an interrupted stream still advances the
        // receiver's cursor usefully.
        documents.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(documents)
    }

    async fn send_response(&self, response: &SyncResponse) {
        let data = match serde_json::to_vec(response) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to serialize sync response");
                return;
            }
        };
        self.stats.lock().bytes_sent += data.len() as u64;
        if let Err(e) = self
            .transport
            .publish(SYNC_RESPONSE_TOPIC, Bytes::from(data))
            .await
        {
            warn!(error = %e, "failed to publish sync response");
        }
    }

    async fn spawn_response_handler(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> meshdb_core::Result<tokio::task::JoinHandle<()>> {
        let mut rx = self.transport.subscribe(SYNC_RESPONSE_TOPIC).await?;
        let this = self.clone();

        Ok(tokio::spawn(async move {
            let self_id = this.transport.self_id();
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some(message) = message else { return };
                        this.handle_response(&message.data, &self_id);
                    }
                    _ = shutdown.changed() => {
                        debug!("sync response handler shutting down");
                        return;
                    }
                }
            }
        }))
    }

    fn handle_response(&self, data: &[u8], self_id: &str) {
        let response: SyncResponse = match serde_json::from_slice(data) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "ignoring unparseable sync response");
                return;
            }
        };
        if response.node_id == self_id {
            return;
        }
        if !response.success {
            warn!(
                peer = %response.node_id,
                error = response.error_message.as_deref().unwrap_or("unknown"),
                "sync request rejected by peer"
            );
            return;
        }

        self.stats.lock().bytes_received += data.len() as u64;
        let origin = response.node_id.clone();
        let documents = match response.into_documents() {
            Ok(documents) => documents,
            Err(e) => {
                warn!(peer = %origin, error = %e, "failed to decode sync batch");
                return;
            }
        };

        let mut applied = 0u64;
        let mut conflicts = 0u64;
        for doc in documents {
            match self.store.apply_remote_upsert(doc, &origin, self_id) {
                Ok(RemoteOutcome::Skipped) => conflicts += 1,
                Ok(_) => applied += 1,
                Err(e) => warn!(peer = %origin, error = %e, "failed to apply synced document"),
            }
        }

        let mut stats = self.stats.lock();
        stats.documents_received += applied;
        stats.conflicts_detected += conflicts;
        stats.conflicts_resolved += conflicts;
        if applied > 0 {
            info!(peer = %origin, applied, conflicts, "applied sync batch");
        }
    }
}
