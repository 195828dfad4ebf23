//! In-process persistence backend.
//!
//! Used when the server runs without a storage path and throughout the test
//! suite. Keeps per-document save counters so callers can observe how often
//! a document was flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};

use super::{
    AnnotationSink, CommentRecord, NewComment, PersistedDocument, PersistenceError,
    PersistenceGateway,
};
use crate::ids::{now_millis, DocumentId};
use crate::schema::ReportDocument;

#[derive(Default)]
struct MemoryState {
    documents: HashMap<DocumentId, PersistedDocument>,
    save_counts: HashMap<DocumentId, u64>,
    comments: HashMap<DocumentId, Vec<CommentRecord>>,
}

/// Volatile [`PersistenceGateway`] backed by a hash map.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate what `load` returns for a document.
    pub fn seed(&self, document_id: DocumentId, document: PersistedDocument) {
        self.with_state(|state| {
            state.documents.insert(document_id, document);
        });
    }

    /// Make every subsequent `save` and `record` fail (or succeed again).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `load` fail (or succeed again).
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// What is currently stored for a document.
    pub fn stored(&self, document_id: &DocumentId) -> Option<PersistedDocument> {
        self.with_state(|state| state.documents.get(document_id).cloned())
    }

    /// Number of successful saves for a document.
    pub fn save_count(&self, document_id: &DocumentId) -> u64 {
        self.with_state(|state| state.save_counts.get(document_id).copied().unwrap_or(0))
    }

    pub fn comments(&self, document_id: &DocumentId) -> Vec<CommentRecord> {
        self.with_state(|state| state.comments.get(document_id).cloned().unwrap_or_default())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl PersistenceGateway for MemoryGateway {
    fn load<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<PersistedDocument, PersistenceError>> {
        async move {
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("memory gateway load disabled".into()));
            }
            Ok(self
                .with_state(|state| state.documents.get(document_id).cloned())
                .unwrap_or_default())
        }
        .boxed()
    }

    fn save<'a>(
        &'a self,
        document_id: &'a DocumentId,
        binary_replica: Vec<u8>,
        content: ReportDocument,
    ) -> BoxFuture<'a, Result<(), PersistenceError>> {
        async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("memory gateway save disabled".into()));
            }
            self.with_state(|state| {
                state.documents.insert(
                    document_id.clone(),
                    PersistedDocument {
                        binary_replica: Some(binary_replica),
                        plain_snapshot: Some(content),
                    },
                );
                *state.save_counts.entry(document_id.clone()).or_insert(0) += 1;
            });
            Ok(())
        }
        .boxed()
    }
}

impl AnnotationSink for MemoryGateway {
    fn record<'a>(
        &'a self,
        document_id: &'a DocumentId,
        comment: NewComment,
    ) -> BoxFuture<'a, Result<CommentRecord, PersistenceError>> {
        async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("memory gateway save disabled".into()));
            }
            let record = CommentRecord::new(document_id.clone(), comment, now_millis());
            self.with_state(|state| {
                state
                    .comments
                    .entry(document_id.clone())
                    .or_default()
                    .push(record.clone());
            });
            Ok(record)
        }
        .boxed()
    }
}
