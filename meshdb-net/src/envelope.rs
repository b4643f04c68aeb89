//! Wire envelopes: the gossip message and the resync request/response.
//! Everything on the wire is JSON.

use crate::compression::{compress, decompress, CompressionKind};
use chrono::{DateTime, Utc};
use meshdb_core::{Document, Operation, Result};
use serde::{Deserialize, Serialize};

/// Topic carrying every mutation.
pub const GOSSIP_TOPIC: &str = "db-sync";
/// Topic carrying resync requests.
pub const SYNC_REQUEST_TOPIC: &str = "sync_request";
/// Topic carrying resync response batches.
pub const SYNC_RESPONSE_TOPIC: &str = "sync_response";

/// One replicated mutation. Create/update carry the full document; delete
/// carries only the id. The author's identity is the transport-layer peer
/// id of the message, not a JSON field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

impl GossipMessage {
    pub fn create(document: Document) -> Self {
        Self {
            operation: Operation::Create,
            document: Some(document),
            document_id: None,
        }
    }

    pub fn update(document: Document) -> Self {
        Self {
            operation: Operation::Update,
            document: Some(document),
            document_id: None,
        }
    }

    pub fn delete(document_id: String) -> Self {
        Self {
            operation: Operation::Delete,
            document: None,
            document_id: Some(document_id),
        }
    }

    /// The id this message is about, wherever it is carried.
    pub fn doc_id(&self) -> Option<&str> {
        self.document
            .as_ref()
            .map(|d| d.id.as_str())
            .or(self.document_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Full,
    Incremental,
    Collection,
}

/// A resync request, broadcast to every peer on the request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub node_id: String,
    pub request_type: SyncKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub batch_size: usize,
    pub use_compression: bool,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One batch of documents answering a [`SyncRequest`]. A responder with
/// more than `batch_size` matches streams several of these; `has_more` is
/// set on every batch but the last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub node_id: String,
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Plain documents when uncompressed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Document>,
    /// Gzip of the JSON document array when `compressed` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    pub documents_count: usize,
    pub has_more: bool,
    pub compressed: bool,
    pub timestamp: DateTime<Utc>,
}

impl SyncResponse {
    /// Build a success batch, compressing the document array if asked.
    pub fn batch(
        node_id: &str,
        request_id: &str,
        documents: Vec<Document>,
        has_more: bool,
        use_compression: bool,
        level: u32,
    ) -> Result<Self> {
        let documents_count = documents.len();
        let (documents, payload) = if use_compression {
            let raw = serde_json::to_vec(&documents)?;
            (
                Vec::new(),
                Some(compress(&raw, CompressionKind::Gzip, level)?),
            )
        } else {
            (documents, None)
        };

        Ok(Self {
            node_id: node_id.to_string(),
            request_id: request_id.to_string(),
            success: true,
            error_message: None,
            documents,
            payload,
            documents_count,
            has_more,
            compressed: use_compression,
            timestamp: Utc::now(),
        })
    }

    pub fn failure(node_id: &str, request_id: &str, message: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            request_id: request_id.to_string(),
            success: false,
            error_message: Some(message),
            documents: Vec::new(),
            payload: None,
            documents_count: 0,
            has_more: false,
            compressed: false,
            timestamp: Utc::now(),
        }
    }

    /// The carried documents, decompressing when necessary.
    pub fn into_documents(self) -> Result<Vec<Document>> {
        if !self.compressed {
            return Ok(self.documents);
        }
        match self.payload {
            Some(payload) => {
                let raw = decompress(&payload, CompressionKind::Gzip)?;
                Ok(serde_json::from_slice(&raw)?)
            }
            None => Ok(Vec::new()),
        }
    }
}
