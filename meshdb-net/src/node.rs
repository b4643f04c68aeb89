//! Node assembly: store + transport + replicator + resync, wired together
//! from one `Config` value.

use crate::replicator::Replicator;
use crate::swarm::{P2pConfig, P2pTransport};
use crate::sync::{SyncConfig, SyncManager, SyncStats};
use crate::transport::{NodeId, PeerTransport};
use meshdb_core::{Config, Result};
use meshdb_store::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// A running meshdb node: the local store plus its replication machinery.
pub struct MeshNode {
    store: Arc<Store>,
    transport: Arc<dyn PeerTransport>,
    replicator: Arc<Replicator>,
    sync: Arc<SyncManager>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshNode {
    /// Start a node on the libp2p transport described by `config`.
    pub async fn start(config: &Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config.general.data_dir)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport =
            P2pTransport::spawn(P2pConfig::from(&config.network), shutdown_rx).await?;
        Self::assemble(store, transport, SyncConfig::default(), shutdown_tx).await
    }

    /// Start a node on an externally built store and transport. Tests use
    /// this with the in-memory hub.
    pub async fn start_with_transport(
        store: Arc<Store>,
        transport: Arc<dyn PeerTransport>,
        sync_config: SyncConfig,
    ) -> Result<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Self::assemble(store, transport, sync_config, shutdown_tx).await
    }

    async fn assemble(
        store: Arc<Store>,
        transport: Arc<dyn PeerTransport>,
        sync_config: SyncConfig,
        shutdown_tx: watch::Sender<bool>,
    ) -> Result<Self> {
        let shutdown_rx = shutdown_tx.subscribe();

        let replicator = Arc::new(Replicator::new(store.clone(), transport.clone()));
        let mut handles = replicator.start(shutdown_rx.clone()).await?;

        let sync = Arc::new(SyncManager::new(
            store.clone(),
            transport.clone(),
            sync_config,
        ));
        handles.extend(sync.start(shutdown_rx).await?);

        info!(node = %transport.self_id(), "meshdb node started");
        Ok(Self {
            store,
            transport,
            replicator,
            sync,
            shutdown_tx,
            handles: Mutex::new(handles),
        })
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.transport.self_id()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.transport.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peers().len()
    }

    pub fn sync_manager(&self) -> Arc<SyncManager> {
        self.sync.clone()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Re-announce every local document on the gossip topic.
    pub fn announce_all(&self) {
        self.replicator.announce_all();
    }

    /// Watch channel other workers (API server, sweepers) can hang off.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every background worker, waiting a bounded time for each.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("a background worker did not stop in time");
            }
        }
        info!("meshdb node stopped");
    }
}
