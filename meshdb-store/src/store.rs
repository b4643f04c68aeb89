//! The document store: in-memory index over every document on the node,
//! write-through persistence, and post-commit event fan-out.
//!
//! Documents live in one of three tiers, all owned by the store:
//!
//! ```text
//!   live    - plain `Document`s, the hot tier
//!   packed  - payload gzip-compressed in memory (memory sweeper, step 1)
//!   evicted - on disk only, id -> collection retained (sweeper, step 2)
//! ```
//!
//! Reads see all three tiers; an access promotes the document back to live.
//! The store is the only mutator. Remote (gossip) writes enter through
//! `apply_remote_upsert` / `apply_remote_delete`, which persist and notify
//! local subscribers but are tagged so the replicator does not gossip them
//! again.
//!
//! Lock discipline: mutators serialize end-to-end (map change, persist,
//! event publish) behind one mutator lock, which is what makes events
//! arrive in commit order and keeps the on-disk state from racing behind
//! the map. The map's reader-writer lock is only ever held for the memory
//! operation itself, never across file or network I/O; readers take it
//! shared and bypass the mutator lock entirely. The one exception is
//! `restore_from_backup`, which holds the map lock for the whole swap so
//! no reader observes a half-restored tree.

use crate::events::{EventBus, EventOrigin, PendingGossip, StoreEvent};
use crate::index::{IndexInfo, IndexKind, IndexManager};
use crate::persistence::PersistenceManager;
use crate::wal;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use meshdb_core::metrics::Metrics;
use meshdb_core::value::estimate_document_size;
use meshdb_core::{Document, Error, Operation, Result};
use meshdb_query::Query;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A document whose payload is held gzip-compressed in memory.
struct PackedDocument {
    collection: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    payload: Vec<u8>,
}

/// Outcome of a remote apply, for replication accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    AppliedCreate,
    AppliedUpdate,
    /// Local copy won the conflict; nothing changed.
    Skipped,
}

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub live: usize,
    pub packed: usize,
    pub evicted: usize,
    pub collections: usize,
    pub estimated_bytes: usize,
}

pub struct Store {
    /// Serializes mutators end-to-end. Readers never take it.
    mutation: Mutex<()>,
    documents: RwLock<HashMap<String, Document>>,
    packed: RwLock<HashMap<String, PackedDocument>>,
    /// id -> collection for documents that only exist on disk.
    evicted: RwLock<HashMap<String, String>>,
    /// id -> logical access clock, for LRU eviction decisions.
    access: Mutex<HashMap<String, u64>>,
    clock: AtomicU64,
    persistence: Option<Arc<PersistenceManager>>,
    events: EventBus,
    indexes: IndexManager,
    pending_gossip: PendingGossip,
    metrics: Metrics,
}

impl Store {
    /// A purely in-memory store. Mutations succeed without touching disk;
    /// backups are unavailable.
    pub fn in_memory() -> Self {
        Self::assemble(None, HashMap::new())
    }

    /// Open a persistent store: load every document file, then replay the
    /// WAL on top. Recovery is silent; no events are emitted.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let persistence = Arc::new(PersistenceManager::new(data_dir)?);
        let mut documents = persistence.load_all_documents()?;
        wal::replay(persistence.read_wal()?, &mut documents);
        debug!(count = documents.len(), "recovered document map");
        Ok(Self::assemble(Some(persistence), documents))
    }

    fn assemble(
        persistence: Option<Arc<PersistenceManager>>,
        documents: HashMap<String, Document>,
    ) -> Self {
        Self {
            mutation: Mutex::new(()),
            documents: RwLock::new(documents),
            packed: RwLock::new(HashMap::new()),
            evicted: RwLock::new(HashMap::new()),
            access: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(1),
            persistence,
            events: EventBus::default(),
            indexes: IndexManager::new(),
            pending_gossip: PendingGossip::new(),
            metrics: Metrics::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pending_gossip(&self) -> PendingGossip {
        self.pending_gossip.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    // ---------------------------------------------------------------
    // CRUD
    // ---------------------------------------------------------------

    /// Create a document. The new id is returned inside the document.
    ///
    /// If persistence fails the in-memory insert stays visible and the
    /// error is returned; no event is emitted and nothing is gossiped.
    pub fn create(&self, collection: &str, data: Map<String, Value>) -> Result<Document> {
        let _commit = self.mutation.lock();
        let doc = Document::new(collection, data);

        self.indexes.add_document(&doc)?;
        self.documents.write().insert(doc.id.clone(), doc.clone());
        self.touch_access(&doc.id);

        if let Some(pm) = &self.persistence {
            if let Err(e) = pm.save_document(&doc) {
                self.metrics.record_persistence_error();
                warn!(id = %doc.id, error = %e, "document created in memory but not persisted");
                return Err(e);
            }
        }

        self.publish(Operation::Create, &doc, EventOrigin::Local);
        self.metrics.record_create();
        Ok(doc)
    }

    /// Fetch a document by id, promoting it to the live tier.
    pub fn get(&self, id: &str) -> Result<Document> {
        if let Some(doc) = self.documents.read().get(id) {
            self.touch_access(id);
            return Ok(doc.clone());
        }
        if let Some(doc) = self.promote(id)? {
            return Ok(doc);
        }
        Err(Error::not_found("document", id))
    }

    /// Shallow-merge `patch` into the document's data.
    pub fn update(&self, id: &str, patch: Map<String, Value>) -> Result<Document> {
        let _commit = self.mutation.lock();
        // Make sure a packed or evicted copy is live before mutating.
        if !self.documents.read().contains_key(id) {
            self.promote(id)?;
        }

        let new = {
            let mut documents = self.documents.write();
            let current = documents
                .get(id)
                .ok_or_else(|| Error::not_found("document", id))?;
            let old = current.clone();
            let mut new = old.clone();
            new.apply_patch(patch);

            self.indexes.update_document(&old, &new)?;
            documents.insert(id.to_string(), new.clone());
            new
        };
        self.touch_access(id);

        if let Some(pm) = &self.persistence {
            if let Err(e) = pm.update_document(&new) {
                self.metrics.record_persistence_error();
                warn!(id, error = %e, "document updated in memory but not persisted");
                return Err(e);
            }
        }

        self.publish(Operation::Update, &new, EventOrigin::Local);
        self.metrics.record_update();
        Ok(new)
    }

    /// Delete a document. Subscribers receive a copy of its last state.
    pub fn delete(&self, id: &str) -> Result<()> {
        let _commit = self.mutation.lock();
        if !self.documents.read().contains_key(id) {
            self.promote(id)?;
        }

        let doc = {
            let mut documents = self.documents.write();
            let doc = documents
                .remove(id)
                .ok_or_else(|| Error::not_found("document", id))?;
            self.indexes.remove_document(&doc.collection, id);
            doc
        };
        self.access.lock().remove(id);

        if let Some(pm) = &self.persistence {
            if let Err(e) = pm.delete_document(&doc.collection, id) {
                self.metrics.record_persistence_error();
                warn!(id, error = %e, "document removed from memory but deletion not persisted");
                return Err(e);
            }
        }

        self.publish(Operation::Delete, &doc, EventOrigin::Local);
        self.metrics.record_delete();
        Ok(())
    }

    /// Every document of a collection, in creation order.
    pub fn get_all(&self, collection: &str) -> Vec<Document> {
        let mut results: Vec<Document> = self
            .documents
            .read()
            .values()
            .filter(|d| d.collection == collection)
            .cloned()
            .collect();

        {
            let packed = self.packed.read();
            for (id, entry) in packed.iter().filter(|(_, p)| p.collection == collection) {
                match unpack(id, entry) {
                    Ok(doc) => results.push(doc),
                    Err(e) => warn!(id, error = %e, "failed to unpack document"),
                }
            }
        }

        let on_disk: Vec<String> = self
            .evicted
            .read()
            .iter()
            .filter(|(_, c)| c.as_str() == collection)
            .map(|(id, _)| id.clone())
            .collect();
        if let Some(pm) = &self.persistence {
            for id in on_disk {
                match pm.load_document(collection, &id) {
                    Ok(Some(doc)) => results.push(doc),
                    Ok(None) => warn!(id, "evicted document file is missing"),
                    Err(e) => warn!(id, error = %e, "failed to reload evicted document"),
                }
            }
        }

        results.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        results
    }

    /// Flat equality query: every `(k, v)` pair must match a top-level
    /// field strictly (no coercion).
    pub fn query(&self, collection: &str, filter: &Map<String, Value>) -> Vec<Document> {
        self.metrics.record_query();
        self.get_all(collection)
            .into_iter()
            .filter(|doc| {
                filter
                    .iter()
                    .all(|(k, v)| doc.data.get(k).map(|dv| dv == v).unwrap_or(false))
            })
            .collect()
    }

    /// Full query through the predicate engine.
    pub fn search(&self, query: &Query) -> Result<Vec<Document>> {
        self.metrics.record_query();
        query.execute(self.get_all(&query.collection))
    }

    /// All collection names with at least one document, sorted.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .documents
            .read()
            .values()
            .map(|d| d.collection.clone())
            .collect();
        names.extend(self.packed.read().values().map(|p| p.collection.clone()));
        names.extend(self.evicted.read().values().cloned());
        names.sort();
        names.dedup();
        names
    }

    pub fn stats(&self) -> StoreStats {
        let live = self.documents.read().len();
        let packed = self.packed.read().len();
        let evicted = self.evicted.read().len();
        StoreStats {
            documents: live + packed + evicted,
            live,
            packed,
            evicted,
            collections: self.collections().len(),
            estimated_bytes: self.estimated_bytes(),
        }
    }

    // ---------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------

    pub fn register_event_callback<F>(&self, callback: F)
    where
        F: Fn(StoreEvent) + Send + Sync + 'static,
    {
        self.events.register_callback(callback);
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, op: Operation, doc: &Document, origin: EventOrigin) {
        self.events.publish(StoreEvent {
            op,
            collection: doc.collection.clone(),
            id: doc.id.clone(),
            document: Some(doc.clone()),
            origin,
        });
    }

    // ---------------------------------------------------------------
    // Backups
    // ---------------------------------------------------------------

    fn persistence(&self) -> Result<&Arc<PersistenceManager>> {
        self.persistence
            .as_ref()
            .ok_or_else(|| Error::persistence("persistence is not enabled"))
    }

    pub fn create_backup(&self) -> Result<String> {
        self.persistence()?.create_backup()
    }

    pub fn list_backups(&self) -> Result<Vec<String>> {
        self.persistence()?.list_backups()
    }

    pub fn delete_backup(&self, name: &str) -> Result<()> {
        self.persistence()?.delete_backup(name)
    }

    /// Swap the on-disk state for the backup's and reload the map from it.
    /// Holds the map write lock for the duration: no mutation can observe
    /// a half-restored store.
    pub fn restore_from_backup(&self, name: &str) -> Result<()> {
        let _commit = self.mutation.lock();
        let pm = self.persistence()?.clone();

        let mut documents = self.documents.write();
        let mut packed = self.packed.write();
        let mut evicted = self.evicted.write();

        pm.restore_from_backup(name)?;
        let mut restored = pm.load_all_documents()?;
        wal::replay(pm.read_wal()?, &mut restored);

        let docs: Vec<Document> = restored.values().cloned().collect();
        self.indexes.rebuild_all(&docs)?;

        *documents = restored;
        packed.clear();
        evicted.clear();
        self.access.lock().clear();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Indexes
    // ---------------------------------------------------------------

    pub fn create_index(
        &self,
        name: &str,
        collection: &str,
        fields: Vec<String>,
        kind: IndexKind,
    ) -> Result<()> {
        let existing = self.get_all(collection);
        self.indexes.create_index(name, collection, fields, kind, &existing)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indexes.drop_index(name)
    }

    pub fn list_indexes(&self) -> Vec<IndexInfo> {
        self.indexes.list()
    }

    pub fn lookup_index(&self, index_name: &str, key: &str) -> Result<Vec<String>> {
        self.indexes.lookup(index_name, key)
    }

    pub fn lookup_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        self.indexes.lookup_by_field(collection, field, value)
    }

    // ---------------------------------------------------------------
    // Remote apply (replication back-door)
    // ---------------------------------------------------------------

    /// Apply an inbound create/update with last-writer-wins resolution.
    ///
    /// The newer `updated_at` wins; a tie goes to the lexicographically
    /// lower peer id. Losing envelopes are skipped. Winners are persisted
    /// and broadcast with a remote origin so the replicator does not
    /// re-gossip them.
    pub fn apply_remote_upsert(
        &self,
        doc: Document,
        origin_peer: &str,
        local_peer: &str,
    ) -> Result<RemoteOutcome> {
        let _commit = self.mutation.lock();
        let local = self.peek(&doc.id)?;

        let wins = match &local {
            None => true,
            Some(existing) => {
                doc.updated_at > existing.updated_at
                    || (doc.updated_at == existing.updated_at && origin_peer < local_peer)
            }
        };
        if !wins {
            self.metrics.record_remote_skipped();
            return Ok(RemoteOutcome::Skipped);
        }

        let op = if local.is_some() {
            Operation::Update
        } else {
            Operation::Create
        };

        // Convergence beats a per-node constraint: a unique-index clash
        // from the swarm is logged, the document still lands.
        if let Some(existing) = &local {
            if let Err(e) = self.indexes.update_document(existing, &doc) {
                warn!(id = %doc.id, error = %e, "remote document violates local index");
            }
        } else if let Err(e) = self.indexes.add_document(&doc) {
            warn!(id = %doc.id, error = %e, "remote document violates local index");
        }

        {
            let mut documents = self.documents.write();
            documents.insert(doc.id.clone(), doc.clone());
        }
        self.packed.write().remove(&doc.id);
        self.evicted.write().remove(&doc.id);
        self.touch_access(&doc.id);

        if let Some(pm) = &self.persistence {
            if let Err(e) = pm.write_document(&doc, op) {
                self.metrics.record_persistence_error();
                warn!(id = %doc.id, error = %e, "failed to persist replicated document");
            }
        }

        self.publish(op, &doc, EventOrigin::Remote);
        self.metrics.record_remote_applied();
        Ok(match op {
            Operation::Create => RemoteOutcome::AppliedCreate,
            _ => RemoteOutcome::AppliedUpdate,
        })
    }

    /// Apply an inbound delete. Tombstoneless: removes whatever is present
    /// regardless of timestamps. Returns whether anything was removed.
    pub fn apply_remote_delete(&self, id: &str) -> Result<bool> {
        let _commit = self.mutation.lock();
        let Some(doc) = self.peek(id)? else {
            return Ok(false);
        };

        self.documents.write().remove(id);
        self.packed.write().remove(id);
        self.evicted.write().remove(id);
        self.access.lock().remove(id);
        self.indexes.remove_document(&doc.collection, id);

        if let Some(pm) = &self.persistence {
            if let Err(e) = pm.delete_document(&doc.collection, id) {
                warn!(id, error = %e, "failed to persist replicated delete");
            }
        }

        self.publish(Operation::Delete, &doc, EventOrigin::Remote);
        self.metrics.record_remote_applied();
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Memory tiers (driven by the memory sweeper)
    // ---------------------------------------------------------------

    /// Gzip a live document's payload in place. Skips documents awaiting
    /// gossip. Returns whether anything was packed.
    pub fn pack_document(&self, id: &str) -> Result<bool> {
        let _commit = self.mutation.lock();
        if self.pending_gossip.contains(id) {
            return Ok(false);
        }

        let Some(doc) = self.documents.read().get(id).cloned() else {
            return Ok(false);
        };

        let raw = serde_json::to_vec(&doc.data)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&raw)
            .and_then(|_| encoder.finish())
            .map(|payload| {
                self.packed.write().insert(
                    id.to_string(),
                    PackedDocument {
                        collection: doc.collection.clone(),
                        created_at: doc.created_at,
                        updated_at: doc.updated_at,
                        payload,
                    },
                );
                self.documents.write().remove(id);
            })
            .map_err(|e| Error::internal(format!("packing {id}: {e}")))?;
        Ok(true)
    }

    /// Flush a document to disk and drop it from memory. Skips documents
    /// awaiting gossip. A later `get` reloads it transparently.
    pub fn evict_to_disk(&self, id: &str) -> Result<bool> {
        let _commit = self.mutation.lock();
        if self.pending_gossip.contains(id) {
            return Ok(false);
        }
        let pm = self.persistence()?.clone();

        let doc = match self.documents.read().get(id).cloned() {
            Some(doc) => Some(doc),
            None => match self.packed.read().get(id) {
                Some(entry) => Some(unpack(id, entry)?),
                None => None,
            },
        };
        let Some(doc) = doc else {
            return Ok(false);
        };

        pm.write_document(&doc, Operation::Update)?;

        self.documents.write().remove(id);
        self.packed.write().remove(id);
        self.evicted
            .write()
            .insert(id.to_string(), doc.collection.clone());
        self.access.lock().remove(id);
        Ok(true)
    }

    /// Estimated in-memory footprint of both resident tiers.
    pub fn estimated_bytes(&self) -> usize {
        let live: usize = self
            .documents
            .read()
            .values()
            .map(|d| estimate_document_size(&d.id, &d.collection, &d.data))
            .sum();
        let packed: usize = self
            .packed
            .read()
            .values()
            .map(|p| p.payload.len() + p.collection.len() + 100)
            .sum();
        live + packed
    }

    /// Number of documents resident in memory (live + packed).
    pub fn in_memory_count(&self) -> usize {
        self.documents.read().len() + self.packed.read().len()
    }

    /// Ids of live, not-yet-packed documents.
    pub fn live_ids(&self) -> Vec<String> {
        self.documents.read().keys().cloned().collect()
    }

    /// Snapshot of the access clock for in-memory documents; lower means
    /// colder.
    pub fn access_snapshot(&self) -> Vec<(String, u64)> {
        let access = self.access.lock();
        let documents = self.documents.read();
        let packed = self.packed.read();
        documents
            .keys()
            .chain(packed.keys())
            .map(|id| (id.clone(), access.get(id).copied().unwrap_or(0)))
            .collect()
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn touch_access(&self, id: &str) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        self.access.lock().insert(id.to_string(), tick);
    }

    /// Move a packed or evicted document back into the live tier and
    /// return it. `Ok(None)` when the id is unknown.
    fn promote(&self, id: &str) -> Result<Option<Document>> {
        let packed_entry = {
            let packed = self.packed.read();
            packed.get(id).map(|entry| unpack(id, entry)).transpose()?
        };
        if let Some(doc) = packed_entry {
            self.packed.write().remove(id);
            self.documents.write().insert(id.to_string(), doc.clone());
            self.touch_access(id);
            return Ok(Some(doc));
        }

        let collection = self.evicted.read().get(id).cloned();
        if let Some(collection) = collection {
            let pm = self.persistence()?.clone();
            match pm.load_document(&collection, id)? {
                Some(doc) => {
                    self.evicted.write().remove(id);
                    self.documents.write().insert(id.to_string(), doc.clone());
                    self.touch_access(id);
                    return Ok(Some(doc));
                }
                None => {
                    warn!(id, "evicted document vanished from disk");
                    self.evicted.write().remove(id);
                }
            }
        }
        Ok(None)
    }

    /// Current state of a document across all tiers, without promoting.
    fn peek(&self, id: &str) -> Result<Option<Document>> {
        if let Some(doc) = self.documents.read().get(id) {
            return Ok(Some(doc.clone()));
        }
        if let Some(entry) = self.packed.read().get(id) {
            return Ok(Some(unpack(id, entry)?));
        }
        let collection = self.evicted.read().get(id).cloned();
        if let Some(collection) = collection {
            if let Some(pm) = &self.persistence {
                return pm.load_document(&collection, id);
            }
        }
        Ok(None)
    }
}

fn unpack(id: &str, entry: &PackedDocument) -> Result<Document> {
    let mut decoder = GzDecoder::new(entry.payload.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| Error::internal(format!("unpacking {id}: {e}")))?;
    let data: Map<String, Value> = serde_json::from_slice(&raw)?;
    Ok(Document {
        id: id.to_string(),
        collection: entry.collection.clone(),
        data,
        created_at: entry.created_at,
        updated_at: entry.updated_at,
    })
}
