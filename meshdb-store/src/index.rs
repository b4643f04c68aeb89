//! Secondary indexes: unique, non-unique and text, per collection.
//!
//! A composite key joins the indexed field values with `\u{1F}` (the ASCII
//! unit separator), which never appears in rendered scalar values. Indexes
//! are maintained synchronously on the store's mutation path, so a unique
//! violation rejects the write before anything is committed. Documents that
//! lack an indexed field are simply not indexed (sparse indexes).

use chrono::{DateTime, Utc};
use meshdb_core::value::{display_string, lookup_path};
use meshdb_core::{Document, Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const KEY_SEPARATOR: char = '\u{1F}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    #[serde(rename = "unique")]
    Unique,
    #[serde(rename = "non-unique")]
    NonUnique,
    #[serde(rename = "text")]
    Text,
}

/// Public description of an index, for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub collection: String,
    pub fields: Vec<String>,
    pub kind: IndexKind,
    pub entries: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Index {
    name: String,
    collection: String,
    fields: Vec<String>,
    kind: IndexKind,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    /// composite key -> document ids
    data: HashMap<String, Vec<String>>,
}

impl Index {
    fn new(name: &str, collection: &str, fields: Vec<String>, kind: IndexKind) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            fields,
            kind,
            created_at: now,
            updated_at: now,
            data: HashMap::new(),
        }
    }

    /// Composite key for a document, or `None` when any indexed field is
    /// absent.
    fn key_for(&self, doc: &Document) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if field == "_id" {
                parts.push(doc.id.clone());
                continue;
            }
            parts.push(display_string(lookup_path(&doc.data, field)?));
        }
        Some(parts.join(&KEY_SEPARATOR.to_string()))
    }

    fn add(&mut self, doc: &Document) -> Result<()> {
        let Some(key) = self.key_for(doc) else {
            return Ok(());
        };

        if self.kind == IndexKind::Unique {
            if let Some(ids) = self.data.get(&key) {
                if ids.iter().any(|id| id != &doc.id) {
                    return Err(Error::conflict(format!(
                        "unique index {} already maps key {:?}",
                        self.name, key
                    )));
                }
            }
        }

        let ids = self.data.entry(key).or_default();
        if !ids.contains(&doc.id) {
            ids.push(doc.id.clone());
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    fn remove(&mut self, doc_id: &str) {
        self.data.retain(|_, ids| {
            ids.retain(|id| id != doc_id);
            !ids.is_empty()
        });
        self.updated_at = Utc::now();
    }

    fn search(&self, value: &str) -> Vec<String> {
        if let Some(ids) = self.data.get(value) {
            return ids.clone();
        }
        if self.kind == IndexKind::Text {
            let mut results = Vec::new();
            for (key, ids) in &self.data {
                if key.contains(value) {
                    results.extend(ids.iter().cloned());
                }
            }
            return results;
        }
        Vec::new()
    }

    fn info(&self) -> IndexInfo {
        IndexInfo {
            name: self.name.clone(),
            collection: self.collection.clone(),
            fields: self.fields.clone(),
            kind: self.kind,
            entries: self.data.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Manages every index on the node. All operations take the manager lock;
/// index payloads are small relative to document I/O.
#[derive(Default)]
pub struct IndexManager {
    indexes: RwLock<HashMap<String, Index>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index and backfill it from `existing`. Fails with
    /// `Conflict` if the name is taken or the backfill violates uniqueness;
    /// a failed backfill leaves no trace of the index.
    pub fn create_index(
        &self,
        name: &str,
        collection: &str,
        fields: Vec<String>,
        kind: IndexKind,
        existing: &[Document],
    ) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::malformed("index", "no fields given"));
        }

        let mut indexes = self.indexes.write();
        if indexes.contains_key(name) {
            return Err(Error::conflict(format!("index {name} already exists")));
        }

        let mut index = Index::new(name, collection, fields, kind);
        for doc in existing {
            if doc.collection == collection {
                index.add(doc)?;
            }
        }
        indexes.insert(name.to_string(), index);
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        if self.indexes.write().remove(name).is_none() {
            return Err(Error::not_found("index", name));
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<IndexInfo> {
        let mut infos: Vec<IndexInfo> =
            self.indexes.read().values().map(Index::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Index a new document in every index of its collection. On a unique
    /// violation, already-applied entries for this document are rolled back.
    pub fn add_document(&self, doc: &Document) -> Result<()> {
        let mut indexes = self.indexes.write();
        let affected: Vec<String> = indexes
            .values()
            .filter(|i| i.collection == doc.collection)
            .map(|i| i.name.clone())
            .collect();

        let mut touched: Vec<&String> = Vec::new();
        for name in &affected {
            let result = indexes.get_mut(name).map(|index| index.add(doc));
            if let Some(Err(e)) = result {
                for done in touched {
                    if let Some(prev) = indexes.get_mut(done) {
                        prev.remove(&doc.id);
                    }
                }
                return Err(e);
            }
            touched.push(name);
        }
        Ok(())
    }

    pub fn remove_document(&self, collection: &str, doc_id: &str) {
        let mut indexes = self.indexes.write();
        for index in indexes.values_mut().filter(|i| i.collection == collection) {
            index.remove(doc_id);
        }
    }

    /// Re-index a document after a mutation. On a unique violation the old
    /// entries are restored and the error is returned.
    pub fn update_document(&self, old: &Document, new: &Document) -> Result<()> {
        let mut indexes = self.indexes.write();
        let affected: Vec<String> = indexes
            .values()
            .filter(|i| i.collection == new.collection)
            .map(|i| i.name.clone())
            .collect();

        for name in &affected {
            if let Some(index) = indexes.get_mut(name) {
                index.remove(&old.id);
            }
        }

        let mut conflict = None;
        for name in &affected {
            if let Some(index) = indexes.get_mut(name) {
                if let Err(e) = index.add(new) {
                    conflict = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = conflict {
            for name in &affected {
                if let Some(index) = indexes.get_mut(name) {
                    index.remove(&new.id);
                    let _ = index.add(old);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Exact-key lookup by index name. Text indexes additionally match by
    /// substring when no exact key exists.
    pub fn lookup(&self, index_name: &str, key: &str) -> Result<Vec<String>> {
        let indexes = self.indexes.read();
        let index = indexes
            .get(index_name)
            .ok_or_else(|| Error::not_found("index", index_name))?;
        Ok(index.search(key))
    }

    /// Lookup through whichever single-field index covers `field`.
    pub fn lookup_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let indexes = self.indexes.read();
        let index = indexes
            .values()
            .find(|i| {
                i.collection == collection && i.fields.len() == 1 && i.fields[0] == field
            })
            .ok_or_else(|| {
                Error::not_found("index", format!("{collection}.{field}"))
            })?;
        Ok(index.search(value))
    }

    /// Throw away all entries and re-add every document. Used after a
    /// backup restore.
    pub fn rebuild_all(&self, documents: &[Document]) -> Result<()> {
        let mut indexes = self.indexes.write();
        for index in indexes.values_mut() {
            index.data.clear();
            for doc in documents {
                if doc.collection == index.collection {
                    index.add(doc)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(collection: &str, data: serde_json::Value) -> Document {
        Document::new(collection, data.as_object().unwrap().clone())
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let manager = IndexManager::new();
        manager
            .create_index("users_email", "users", vec!["email".into()], IndexKind::Unique, &[])
            .unwrap();

        let first = doc("users", json!({"email": "a@x"}));
        manager.add_document(&first).unwrap();

        let second = doc("users", json!({"email": "a@x"}));
        let err = manager.add_document(&second).unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");

        // The winner is still resolvable.
        assert_eq!(manager.lookup("users_email", "a@x").unwrap(), vec![first.id]);
    }

    #[test]
    fn non_unique_index_accumulates_ids() {
        let manager = IndexManager::new();
        manager
            .create_index("users_city", "users", vec!["city".into()], IndexKind::NonUnique, &[])
            .unwrap();

        let a = doc("users", json!({"city": "Madrid"}));
        let b = doc("users", json!({"city": "Madrid"}));
        manager.add_document(&a).unwrap();
        manager.add_document(&b).unwrap();

        let ids = manager.lookup("users_city", "Madrid").unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn text_index_matches_substrings() {
        let manager = IndexManager::new();
        manager
            .create_index("notes_body", "notes", vec!["body".into()], IndexKind::Text, &[])
            .unwrap();

        let a = doc("notes", json!({"body": "the quick brown fox"}));
        manager.add_document(&a).unwrap();

        assert_eq!(manager.lookup("notes_body", "quick bro").unwrap(), vec![a.id.clone()]);
        assert!(manager.lookup("notes_body", "zebra").unwrap().is_empty());
    }

    #[test]
    fn composite_keys_join_fields() {
        let manager = IndexManager::new();
        manager
            .create_index(
                "users_name_city",
                "users",
                vec!["name".into(), "city".into()],
                IndexKind::NonUnique,
                &[],
            )
            .unwrap();

        let a = doc("users", json!({"name": "Ana", "city": "Oslo"}));
        manager.add_document(&a).unwrap();

        let key = format!("Ana{}Oslo", '\u{1F}');
        assert_eq!(manager.lookup("users_name_city", &key).unwrap(), vec![a.id]);
    }

    #[test]
    fn documents_missing_the_field_are_not_indexed() {
        let manager = IndexManager::new();
        manager
            .create_index("users_email", "users", vec!["email".into()], IndexKind::Unique, &[])
            .unwrap();

        let a = doc("users", json!({"name": "no email"}));
        manager.add_document(&a).unwrap();
        assert!(manager.lookup("users_email", "no email").unwrap().is_empty());
    }

    #[test]
    fn update_rolls_back_on_conflict() {
        let manager = IndexManager::new();
        manager
            .create_index("users_email", "users", vec!["email".into()], IndexKind::Unique, &[])
            .unwrap();

        let a = doc("users", json!({"email": "a@x"}));
        let mut b = doc("users", json!({"email": "b@x"}));
        manager.add_document(&a).unwrap();
        manager.add_document(&b).unwrap();

        let old_b = b.clone();
        b.apply_patch(json!({"email": "a@x"}).as_object().unwrap().clone());
        assert!(manager.update_document(&old_b, &b).is_err());

        // b's original entry survived the failed update.
        assert_eq!(manager.lookup("users_email", "b@x").unwrap(), vec![b.id]);
    }

    #[test]
    fn backfill_enforces_uniqueness() {
        let manager = IndexManager::new();
        let docs = vec![
            doc("users", json!({"email": "a@x"})),
            doc("users", json!({"email": "a@x"})),
        ];
        let err = manager
            .create_index("users_email", "users", vec!["email".into()], IndexKind::Unique, &docs)
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
        assert!(manager.list().is_empty());
    }

    #[test]
    fn lookup_by_field_needs_a_single_field_index() {
        let manager = IndexManager::new();
        manager
            .create_index("users_city", "users", vec!["city".into()], IndexKind::NonUnique, &[])
            .unwrap();

        let a = doc("users", json!({"city": "Oslo"}));
        manager.add_document(&a).unwrap();

        assert_eq!(
            manager.lookup_by_field("users", "city", "Oslo").unwrap(),
            vec![a.id]
        );
        assert!(manager.lookup_by_field("users", "name", "x").is_err());
    }
}
