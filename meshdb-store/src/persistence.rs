//! Persistence manager: one pretty-printed JSON file per document plus the
//! write-ahead log, and the snapshot/restore machinery built on top.
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! data_dir/
//!   collections/<collection>/<id>.json
//!   transactions.log
//!   backups/backup_<YYYYMMDD_HHMMSS>/
//! ```
//!
//! File I/O is serialized behind a single mutex. Callers must not invoke
//! these methods while holding the store's map lock.

use crate::wal::{TransactionLog, WalEntry};
use chrono::Utc;
use meshdb_core::{Document, Error, Operation, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct PersistenceManager {
    data_dir: PathBuf,
    wal: Mutex<Option<TransactionLog>>,
}

impl PersistenceManager {
    /// Open the persistence root, creating the directory skeleton and the
    /// WAL if they do not exist yet.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let collections = data_dir.join("collections");
        fs::create_dir_all(&collections)
            .map_err(|e| Error::persistence_io(format!("creating {collections:?}"), e))?;

        let wal = TransactionLog::open(data_dir.join("transactions.log"))?;

        Ok(Self {
            data_dir,
            wal: Mutex::new(Some(wal)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn collections_dir(&self) -> PathBuf {
        self.data_dir.join("collections")
    }

    fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collections_dir().join(collection).join(format!("{id}.json"))
    }

    /// Persist a new document: write its file atomically, then append a
    /// `create` line to the WAL.
    pub fn save_document(&self, doc: &Document) -> Result<()> {
        self.write_document(doc, Operation::Create)
    }

    /// Persist an update. The document file must already exist.
    pub fn update_document(&self, doc: &Document) -> Result<()> {
        let path = self.document_path(&doc.collection, &doc.id);
        if !path.exists() {
            return Err(Error::not_found("document file", &doc.id));
        }
        self.write_document(doc, Operation::Update)
    }

    /// Persist a document under an explicit WAL operation. Used by the
    /// replication apply path, where create-vs-update comes off the wire.
    pub fn write_document(&self, doc: &Document, op: Operation) -> Result<()> {
        let mut wal = self.wal.lock();

        let dir = self.collections_dir().join(&doc.collection);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::persistence_io(format!("creating {dir:?}"), e))?;

        let path = self.document_path(&doc.collection, &doc.id);
        let body = doc
            .to_pretty_json()
            .map_err(|e| Error::malformed("document", e.to_string()))?;
        atomic_write(&path, body.as_bytes())?;

        wal_handle(&mut wal)?.append(op, &doc.id, Some(doc))?;
        Ok(())
    }

    /// Remove a document file and log the deletion.
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<()> {
        let mut wal = self.wal.lock();

        let path = self.document_path(collection, id);
        if !path.exists() {
            return Err(Error::not_found("document file", id));
        }
        fs::remove_file(&path)
            .map_err(|e| Error::persistence_io(format!("removing {path:?}"), e))?;

        wal_handle(&mut wal)?.append(Operation::Delete, id, None)?;
        Ok(())
    }

    /// Read one document back from disk, if its file exists.
    pub fn load_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let path = self.document_path(collection, id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::persistence_io(format!("reading {path:?}"), e)),
        };
        let doc = Document::from_json(&bytes)
            .map_err(|e| Error::malformed("document file", e.to_string()))?;
        Ok(Some(doc))
    }

    /// Traverse the collections tree and parse every document file.
    /// Unparseable files are skipped with a warning, never an abort.
    pub fn load_all_documents(&self) -> Result<HashMap<String, Document>> {
        let mut documents = HashMap::new();
        let collections_dir = self.collections_dir();

        let collections = match fs::read_dir(&collections_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(documents),
            Err(e) => {
                return Err(Error::persistence_io(
                    format!("reading {collections_dir:?}"),
                    e,
                ))
            }
        };

        for collection in collections {
            let collection =
                collection.map_err(|e| Error::persistence_io("reading collection dir", e))?;
            if !collection.path().is_dir() {
                continue;
            }

            let files = fs::read_dir(collection.path())
                .map_err(|e| Error::persistence_io("reading collection dir", e))?;
            for file in files {
                let file = file.map_err(|e| Error::persistence_io("reading doc entry", e))?;
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fs::read(&path).map_err(Error::from).and_then(|bytes| {
                    Document::from_json(&bytes)
                        .map_err(|e| Error::malformed("document file", e.to_string()))
                }) {
                    Ok(doc) => {
                        documents.insert(doc.id.clone(), doc);
                    }
                    Err(e) => {
                        warn!(path = ?path, error = %e, "skipping unreadable document file");
                    }
                }
            }
        }

        Ok(documents)
    }

    /// Read the whole WAL for startup replay.
    pub fn read_wal(&self) -> Result<Vec<WalEntry>> {
        let mut wal = self.wal.lock();
        wal_handle(&mut wal)?.read_all()
    }

    /// Snapshot the collections tree and the WAL into
    /// `backups/backup_<timestamp>`. The snapshot is assembled in a staging
    /// directory and renamed into place, so concurrent readers of the
    /// backups directory never see a half-written one.
    pub fn create_backup(&self) -> Result<String> {
        let wal = self.wal.lock();
        if wal.is_none() {
            return Err(Error::persistence("WAL is closed"));
        }

        let backups = self.backups_dir();
        fs::create_dir_all(&backups)
            .map_err(|e| Error::persistence_io(format!("creating {backups:?}"), e))?;

        let mut name = format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut n = 1;
        while backups.join(&name).exists() {
            name = format!("backup_{}_{n}", Utc::now().format("%Y%m%d_%H%M%S"));
            n += 1;
        }

        let staging = backups.join(format!(".{name}.tmp"));
        let result = (|| -> Result<()> {
            copy_dir(&self.collections_dir(), &staging.join("collections"))?;
            let wal_src = self.data_dir.join("transactions.log");
            if wal_src.exists() {
                fs::copy(&wal_src, staging.join("transactions.log"))
                    .map_err(|e| Error::persistence_io("copying WAL into backup", e))?;
            }
            fs::rename(&staging, backups.join(&name))
                .map_err(|e| Error::persistence_io("publishing backup", e))?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result?;

        info!(backup = %name, "created backup");
        Ok(name)
    }

    /// Replace the live collections tree and WAL with the named backup's.
    /// The caller is responsible for serializing this against mutations and
    /// reloading its in-memory state afterwards.
    pub fn restore_from_backup(&self, name: &str) -> Result<()> {
        let mut wal = self.wal.lock();

        let backup_dir = self.backups_dir().join(name);
        if !backup_dir.is_dir() {
            return Err(Error::not_found("backup", name));
        }

        // Close the live WAL before swapping files underneath it.
        if let Some(log) = wal.take() {
            log.close()?;
        }

        let collections = self.collections_dir();
        if collections.exists() {
            fs::remove_dir_all(&collections)
                .map_err(|e| Error::persistence_io("removing live collections", e))?;
        }
        copy_dir(&backup_dir.join("collections"), &collections)?;

        let wal_path = self.data_dir.join("transactions.log");
        if wal_path.exists() {
            fs::remove_file(&wal_path)
                .map_err(|e| Error::persistence_io("removing live WAL", e))?;
        }
        let backup_wal = backup_dir.join("transactions.log");
        if backup_wal.exists() {
            fs::copy(&backup_wal, &wal_path)
                .map_err(|e| Error::persistence_io("restoring WAL", e))?;
        }

        *wal = Some(TransactionLog::open(&wal_path)?);
        info!(backup = %name, "restored from backup");
        Ok(())
    }

    /// Backup directory names, oldest first.
    pub fn list_backups(&self) -> Result<Vec<String>> {
        let backups = self.backups_dir();
        let entries = match fs::read_dir(&backups) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::persistence_io(format!("reading {backups:?}"), e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::persistence_io("reading backup entry", e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && name.starts_with("backup_") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete_backup(&self, name: &str) -> Result<()> {
        let backup_dir = self.backups_dir().join(name);
        if !backup_dir.is_dir() {
            return Err(Error::not_found("backup", name));
        }
        fs::remove_dir_all(&backup_dir)
            .map_err(|e| Error::persistence_io(format!("removing backup {name}"), e))?;
        Ok(())
    }
}

fn wal_handle<'a>(
    guard: &'a mut parking_lot::MutexGuard<'_, Option<TransactionLog>>,
) -> Result<&'a mut TransactionLog> {
    guard
        .as_mut()
        .ok_or_else(|| Error::persistence("WAL is closed"))
}

/// Write-to-temp, fsync, rename.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .map_err(|e| Error::persistence_io(format!("creating {tmp:?}"), e))?;
        use std::io::Write as _;
        file.write_all(bytes)
            .map_err(|e| Error::persistence_io(format!("writing {tmp:?}"), e))?;
        file.sync_all()
            .map_err(|e| Error::persistence_io(format!("syncing {tmp:?}"), e))?;
    }
    fs::rename(&tmp, path)
        .map_err(|e| Error::persistence_io(format!("renaming into {path:?}"), e))?;
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)
        .map_err(|e| Error::persistence_io(format!("creating {dst:?}"), e))?;

    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::persistence_io(format!("reading {src:?}"), e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| Error::persistence_io("reading dir entry", e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .map_err(|e| Error::persistence_io(format!("copying {from:?}"), e))?;
        }
    }
    Ok(())
}
