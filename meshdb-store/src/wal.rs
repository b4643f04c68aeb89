//! Write-ahead log: append-only, newline-delimited JSON.
//!
//! One object per line, shape `{op, timestamp, doc_id, document?}`. Entries
//! carry the full post-state for create/update, so replay is idempotent and
//! order alone determines the outcome. Every append is flushed and fsync'd
//! before the caller sees success.

use chrono::{DateTime, Utc};
use meshdb_core::{Document, Error, Operation, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One committed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op: Operation,
    pub timestamp: DateTime<Utc>,
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
}

/// Append-only transaction log backed by a single file.
pub struct TransactionLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TransactionLog {
    /// Open (or create) the log at `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::persistence_io(format!("creating WAL directory {parent:?}"), e)
            })?;
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::persistence_io(format!("opening WAL {path:?}"), e))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and fsync. Returns the serialized length in bytes.
    pub fn append(
        &mut self,
        op: Operation,
        doc_id: &str,
        document: Option<&Document>,
    ) -> Result<u64> {
        let entry = WalEntry {
            op,
            timestamp: Utc::now(),
            doc_id: doc_id.to_string(),
            document: document.cloned(),
        };

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        self.writer
            .write_all(&line)
            .map_err(|e| Error::persistence_io("writing WAL entry", e))?;
        self.writer
            .flush()
            .map_err(|e| Error::persistence_io("flushing WAL", e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::persistence_io("syncing WAL", e))?;

        Ok(line.len() as u64)
    }

    /// Read every entry currently on disk, in append order.
    ///
    /// A torn or corrupt line (a crash mid-append leaves one) is skipped
    /// with a warning rather than poisoning recovery.
    pub fn read_all(&mut self) -> Result<Vec<WalEntry>> {
        self.writer
            .flush()
            .map_err(|e| Error::persistence_io("flushing WAL before read", e))?;

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::persistence_io("opening WAL for read", e)),
        };

        let mut entries = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::persistence_io("reading WAL line", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping unparseable WAL line");
                }
            }
        }
        Ok(entries)
    }

    /// Flush and close. Consumes the log; a restore reopens a fresh one.
    pub fn close(mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| Error::persistence_io("flushing WAL on close", e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::persistence_io("syncing WAL on close", e))?;
        Ok(())
    }
}

/// Apply WAL entries to a document map, newest-wins by append order.
/// Used during startup recovery; emits no events.
pub fn replay(
    entries: Vec<WalEntry>,
    documents: &mut std::collections::HashMap<String, Document>,
) {
    for entry in entries {
        match entry.op {
            Operation::Create | Operation::Update => {
                if let Some(doc) = entry.document {
                    documents.insert(doc.id.clone(), doc);
                }
            }
            Operation::Delete => {
                documents.remove(&entry.doc_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_doc(name: &str) -> Document {
        let data = json!({ "name": name }).as_object().unwrap().clone();
        Document::new("users", data)
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransactionLog::open(dir.path().join("transactions.log")).unwrap();

        let doc = sample_doc("Ana");
        log.append(Operation::Create, &doc.id, Some(&doc)).unwrap();
        log.append(Operation::Delete, &doc.id, None).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, Operation::Create);
        assert_eq!(entries[0].document.as_ref().unwrap().id, doc.id);
        assert_eq!(entries[1].op, Operation::Delete);
        assert!(entries[1].document.is_none());
    }

    #[test]
    fn torn_trailing_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transactions.log");

        let mut log = TransactionLog::open(&path).unwrap();
        let doc = sample_doc("Ana");
        log.append(Operation::Create, &doc.id, Some(&doc)).unwrap();
        drop(log);

        // Simulate a crash mid-append.
        use std::io::Write as _;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"op\":\"crea").unwrap();
        drop(file);

        let mut log = TransactionLog::open(&path).unwrap();
        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn replay_is_idempotent_and_order_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransactionLog::open(dir.path().join("transactions.log")).unwrap();

        let mut doc = sample_doc("Ana");
        log.append(Operation::Create, &doc.id, Some(&doc)).unwrap();
        doc.apply_patch(json!({ "age": 31 }).as_object().unwrap().clone());
        log.append(Operation::Update, &doc.id, Some(&doc)).unwrap();

        let other = sample_doc("Bruno");
        log.append(Operation::Create, &other.id, Some(&other)).unwrap();
        log.append(Operation::Delete, &other.id, None).unwrap();

        let mut map = HashMap::new();
        replay(log.read_all().unwrap(), &mut map);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&doc.id].data["age"], json!(31));

        // Replaying on top of the recovered state changes nothing.
        let mut again = map.clone();
        replay(log.read_all().unwrap(), &mut again);
        assert_eq!(map.len(), again.len());
    }
}
