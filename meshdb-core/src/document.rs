//! # Document Model
//!
//! The atomic replicated entity. A document belongs to exactly one
//! collection, carries an arbitrarily nested JSON payload in `data`, and is
//! identified by a node-global id that never changes.
//!
//! Invariants:
//! - `id` is unique across the whole node, not scoped by collection
//! - `created_at <= updated_at`
//! - `updated_at` never moves backwards for a given id on a given node

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Mutation kind, shared by the WAL, the event bus and the gossip wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// A stored document.
///
/// The serialized shape is exactly `{id, collection, data, created_at,
/// updated_at}`: both the per-document files on disk and the replication
/// envelopes carry this form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub collection: String,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a document with a fresh id and both timestamps set to now.
    pub fn new(collection: impl Into<String>, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            collection: collection.into(),
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge `patch` into `data`: top-level keys in the patch
    /// overwrite, everything else is preserved. Advances `updated_at`,
    /// clamped so it never moves backwards under a stepping wall clock.
    pub fn apply_patch(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.data.insert(key, value);
        }
        self.touch();
    }

    /// Advance `updated_at` to now, or one millisecond past the stored
    /// value if the wall clock has not moved.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn new_document_has_equal_timestamps_and_nonempty_id() {
        let doc = Document::new("users", data(&[("name", json!("Ana"))]));
        assert!(!doc.id.is_empty());
        assert_eq!(doc.created_at, doc.updated_at);
        assert_eq!(doc.collection, "users");
    }

    #[test]
    fn ids_are_unique() {
        let a = Document::new("users", Map::new());
        let b = Document::new("users", Map::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn patch_is_a_shallow_merge() {
        let mut doc = Document::new(
            "users",
            data(&[("name", json!("Ana")), ("age", json!(30))]),
        );
        doc.apply_patch(data(&[("age", json!(31)), ("city", json!("Madrid"))]));

        assert_eq!(doc.data["name"], json!("Ana"));
        assert_eq!(doc.data["age"], json!(31));
        assert_eq!(doc.data["city"], json!("Madrid"));
        assert!(doc.updated_at > doc.created_at);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut doc = Document::new("users", Map::new());
        // Force a future updated_at, as if the wall clock had stepped back.
        doc.updated_at = Utc::now() + Duration::seconds(60);
        let before = doc.updated_at;
        doc.touch();
        assert!(doc.updated_at > before);
    }

    #[test]
    fn serialized_shape_is_stable() {
        let doc = Document::new("users", data(&[("name", json!("Ana"))]));
        let value: Value = serde_json::from_str(&doc.to_pretty_json().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        for field in ["id", "collection", "data", "created_at", "updated_at"] {
            assert!(obj.contains_key(field), "missing field {field}");
        }
        assert_eq!(obj.len(), 5);
    }
}
