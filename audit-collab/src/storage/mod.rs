//! Persistence boundary of the collaboration engine.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   load / save    ┌──────────────────────┐
//! │ ReplicaStore     │ ───────────────► │ PersistenceGateway   │
//! │ AutoSaveScheduler│                  │  ├── MemoryGateway   │
//! └──────────────────┘                  │  └── RocksGateway    │
//!                                       └──────────┬───────────┘
//! ┌──────────────────┐   record         ┌──────────┴───────────┐
//! │ SessionRouter    │ ───────────────► │ AnnotationSink       │
//! │ (comment)        │                  │ (same backends)      │
//! └──────────────────┘                  └──────────────────────┘
//! ```
//!
//! The gateway persists two things per document: the binary Yrs replica and
//! the plain [`ReportDocument`] projection derived from it. Either may be
//! missing; the replica store decides how to cold-start from what it gets.

pub mod memory;
pub mod rocks;

use std::fmt;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{DocumentId, UserId};
use crate::schema::ReportDocument;

pub use memory::MemoryGateway;
pub use rocks::{DocumentMetadata, DocumentStore, RocksGateway, StoreConfig, StoreError};

/// What the storage layer holds for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedDocument {
    /// Yrs v1 update encoding the full replica state.
    pub binary_replica: Option<Vec<u8>>,
    /// Plain projection saved alongside the replica.
    pub plain_snapshot: Option<ReportDocument>,
}

impl PersistedDocument {
    pub fn from_snapshot(snapshot: ReportDocument) -> Self {
        Self {
            binary_replica: None,
            plain_snapshot: Some(snapshot),
        }
    }
}

/// Load/save contract implemented by the storage layer.
pub trait PersistenceGateway: Send + Sync {
    fn load<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<PersistedDocument, PersistenceError>>;

    fn save<'a>(
        &'a self,
        document_id: &'a DocumentId,
        binary_replica: Vec<u8>,
        content: ReportDocument,
    ) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

/// A comment as submitted by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub author: UserId,
    pub author_name: String,
    pub text: String,
    /// Character offset the comment is anchored to, if any.
    pub position: Option<u64>,
}

/// A comment after the annotation store accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub author: UserId,
    pub author_name: String,
    pub text: String,
    pub position: Option<u64>,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
}

impl CommentRecord {
    pub fn new(document_id: DocumentId, comment: NewComment, created_at: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id,
            author: comment.author,
            author_name: comment.author_name,
            text: comment.text,
            position: comment.position,
            created_at,
        }
    }
}

/// Sink for document annotations (comments).
pub trait AnnotationSink: Send + Sync {
    fn record<'a>(
        &'a self,
        document_id: &'a DocumentId,
        comment: NewComment,
    ) -> BoxFuture<'a, Result<CommentRecord, PersistenceError>>;
}

/// Persistence errors surfaced through the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// Backend could not be reached or its worker failed
    Unavailable(String),
    /// Backend rejected the operation
    Storage(String),
    /// Encoding or decoding the stored representation failed
    Serialization(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
            Self::Storage(e) => write!(f, "Storage error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SerializationError(e) | StoreError::DeserializationError(e) => {
                PersistenceError::Serialization(e)
            }
            other => PersistenceError::Storage(other.to_string()),
        }
    }
}
