//! Collaboration service: the one place that owns every per-document registry.
//!
//! ```text
//!                    ┌────────────────────────┐
//! SessionRouter ───► │  CollaborationService  │
//!                    ├────────────────────────┤
//!                    │ DocumentGates          │  one async gate per document
//!                    │ ReplicaStore           │  CRDT replicas
//!                    │ AwarenessTracker       │  presence
//!                    │ AutoSaveScheduler      │  timers
//!                    │ LockRegistry           │  advisory locks
//!                    └──────────┬─────────────┘
//!                               ▼
//!               PersistenceGateway / AnnotationSink
//! ```
//!
//! Operations on a document are expected to run while the caller holds the
//! document's gate (see [`CollaborationService::enter`]). Different documents
//! never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::autosave::{AutoSaveScheduler, FlushError, FlushReceipt, Persister};
use crate::ids::DocumentId;
use crate::lock::LockRegistry;
use crate::presence::AwarenessTracker;
use crate::replica::{DeltaSink, Replica, ReplicaError, ReplicaStore};
use crate::schema::ReportDocument;
use crate::storage::{
    AnnotationSink, CommentRecord, MemoryGateway, NewComment, PersistenceError,
    PersistenceGateway,
};

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// How often an open document is flushed (zero disables autosave)
    #[serde(with = "duration_secs")]
    pub autosave_interval: Duration,
    /// Idle time after which a collaborator is dropped from presence
    #[serde(with = "duration_secs")]
    pub presence_timeout: Duration,
    /// How often the server sweeps for idle collaborators
    #[serde(with = "duration_secs")]
    pub prune_interval: Duration,
    /// Messages buffered per connection before new ones are dropped
    pub outbox_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(30),
            presence_timeout: Duration::from_secs(5 * 60),
            prune_interval: Duration::from_secs(60),
            outbox_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// No autosave, short timeouts, small outboxes.
    pub fn for_testing() -> Self {
        Self {
            autosave_interval: Duration::ZERO,
            presence_timeout: Duration::from_secs(5),
            prune_interval: Duration::from_secs(1),
            outbox_capacity: 64,
        }
    }
}

/// Durations as whole seconds in config files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// One async gate per document id.
///
/// Gates are created on first use and retired once nobody holds or waits
/// for them.
#[derive(Default)]
pub struct DocumentGates {
    gates: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl DocumentGates {
    pub async fn enter(&self, document_id: &DocumentId) -> OwnedMutexGuard<()> {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(document_id.clone())
            .or_default()
            .clone();
        gate.lock_owned().await
    }

    /// Forget the gate if it is idle. Call after dropping the guard.
    pub fn retire(&self, document_id: &DocumentId) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if gates
            .get(document_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(document_id);
        }
    }

    pub fn len(&self) -> usize {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CollaborationService {
    config: CollabConfig,
    gates: Arc<DocumentGates>,
    replicas: Arc<ReplicaStore>,
    awareness: AwarenessTracker,
    autosave: AutoSaveScheduler,
    locks: LockRegistry,
    annotations: Arc<dyn AnnotationSink>,
}

impl CollaborationService {
    pub fn new(
        config: CollabConfig,
        gateway: Arc<dyn PersistenceGateway>,
        annotations: Arc<dyn AnnotationSink>,
    ) -> Self {
        let gates = Arc::new(DocumentGates::default());
        let replicas = Arc::new(ReplicaStore::new(gateway.clone()));
        let persister = Arc::new(Persister::new(replicas.clone(), gateway));
        Self {
            config,
            autosave: AutoSaveScheduler::new(persister, gates.clone()),
            gates,
            replicas,
            awareness: AwarenessTracker::new(),
            locks: LockRegistry::new(),
            annotations,
        }
    }

    /// Service backed by a fresh [`MemoryGateway`], which is returned too.
    pub fn in_memory(config: CollabConfig) -> (Self, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        (Self::new(config, gateway.clone(), gateway.clone()), gateway)
    }

    /// Wait for exclusive access to a document.
    pub async fn enter(&self, document_id: &DocumentId) -> OwnedMutexGuard<()> {
        self.gates.enter(document_id).await
    }

    /// Release the gate and forget it if nobody else is waiting.
    pub fn exit(&self, document_id: &DocumentId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.gates.retire(document_id);
    }

    /// Make the document resident and make sure its autosave timer runs.
    pub async fn open_document(&self, document_id: &DocumentId) -> Arc<Replica> {
        let replica = self.replicas.obtain(document_id).await;
        if !self.autosave.is_scheduled(document_id) {
            self.autosave
                .start(document_id, self.config.autosave_interval);
        }
        replica
    }

    pub async fn apply_update(
        &self,
        document_id: &DocumentId,
        payload: Vec<u8>,
        sink: &dyn DeltaSink,
    ) -> Result<(), ReplicaError> {
        self.replicas.apply_local(document_id, payload, sink).await
    }

    pub async fn flush_now(&self, document_id: &DocumentId) -> Result<FlushReceipt, FlushError> {
        self.autosave.flush_now(document_id).await
    }

    /// Final flush, stop the timer, evict the replica and drop any lock.
    ///
    /// A failed final flush is logged; the document is released anyway.
    /// Calling this for a document that is not open does nothing.
    pub async fn close_document(&self, document_id: &DocumentId) -> Option<FlushReceipt> {
        self.autosave.stop(document_id);
        if !self.replicas.is_resident(document_id).await {
            self.locks.clear(document_id);
            return None;
        }

        let receipt = match self.autosave.flush_now(document_id).await {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                error!("Final save of {document_id} failed: {e}");
                None
            }
        };
        self.replicas.release(document_id).await;
        self.locks.clear(document_id);
        info!("Document {document_id} closed");
        receipt
    }

    pub async fn record_comment(
        &self,
        document_id: &DocumentId,
        comment: NewComment,
    ) -> Result<CommentRecord, PersistenceError> {
        self.annotations.record(document_id, comment).await
    }

    pub async fn content(&self, document_id: &DocumentId) -> Result<ReportDocument, ReplicaError> {
        self.replicas.content(document_id).await
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn replicas(&self) -> &ReplicaStore {
        &self.replicas
    }

    pub fn awareness(&self) -> &AwarenessTracker {
        &self.awareness
    }

    pub fn autosave(&self) -> &AutoSaveScheduler {
        &self.autosave
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn gates(&self) -> &DocumentGates {
        &self.gates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;

    #[test]
    fn test_config_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.autosave_interval, Duration::from_secs(30));
        assert_eq!(config.presence_timeout, Duration::from_secs(300));
        assert_eq!(config.prune_interval, Duration::from_secs(60));
        assert_eq!(config.outbox_capacity, 256);
    }

    #[test]
    fn test_config_from_json_seconds() {
        let config: CollabConfig =
            serde_json::from_str(r#"{"autosave_interval": 10, "outbox_capacity": 8}"#).unwrap();
        assert_eq!(config.autosave_interval, Duration::from_secs(10));
        assert_eq!(config.outbox_capacity, 8);
        assert_eq!(config.presence_timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_gate_serializes_access() {
        let gates = Arc::new(DocumentGates::default());
        let doc = DocumentId::from("D1");

        let guard = gates.enter(&doc).await;
        let waiter = {
            let gates = gates.clone();
            let doc = doc.clone();
            tokio::spawn(async move {
                let _guard = gates.enter(&doc).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Another document is not blocked
        drop(gates.enter(&DocumentId::from("D2")).await);

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_retired_when_idle() {
        let gates = DocumentGates::default();
        let doc = DocumentId::from("D1");

        let guard = gates.enter(&doc).await;
        gates.retire(&doc);
        assert_eq!(gates.len(), 1);

        drop(guard);
        gates.retire(&doc);
        assert!(gates.is_empty());
    }

    #[tokio::test]
    async fn test_close_document_flushes_once_and_releases() {
        let (service, gateway) = CollaborationService::in_memory(CollabConfig::for_testing());
        let doc = DocumentId::from("D1");
        service.open_document(&doc).await;
        service.locks().acquire(&doc, &UserId::from("alice")).unwrap();

        assert!(service.close_document(&doc).await.is_some());
        assert_eq!(gateway.save_count(&doc), 1);
        assert!(!service.replicas().is_resident(&doc).await);
        assert_eq!(service.locks().holder(&doc), None);

        // Second close is a no-op
        assert!(service.close_document(&doc).await.is_none());
        assert_eq!(gateway.save_count(&doc), 1);
    }

    #[tokio::test]
    async fn test_close_document_releases_despite_failed_save() {
        let (service, gateway) = CollaborationService::in_memory(CollabConfig::for_testing());
        let doc = DocumentId::from("D1");
        service.open_document(&doc).await;
        gateway.set_fail_saves(true);

        assert!(service.close_document(&doc).await.is_none());
        assert!(!service.replicas().is_resident(&doc).await);
    }

    #[tokio::test]
    async fn test_open_document_starts_autosave() {
        let (service, _gateway) = CollaborationService::in_memory(CollabConfig::default());
        let doc = DocumentId::from("D1");
        service.open_document(&doc).await;
        assert!(service.autosave().is_scheduled(&doc));

        service.close_document(&doc).await;
        assert!(!service.autosave().is_scheduled(&doc));
    }
}
