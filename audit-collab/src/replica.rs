//! Per-document CRDT replicas.
//!
//! The [`ReplicaStore`] keeps one Yrs [`Doc`] per open document. Replicas are
//! materialized on first use from whatever the [`PersistenceGateway`] holds and
//! stay resident until the session layer releases them.
//!
//! Cold start order:
//! 1. binary replica (Yrs v1 update), if present and decodable
//! 2. plain snapshot, rebuilt through the typed converter in [`crate::schema`]
//! 3. an empty document
//!
//! None of these steps is fatal; a failed step is logged and the next one is
//! tried.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::RwLock;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::ids::DocumentId;
use crate::schema::{self, ReportDocument};
use crate::storage::{PersistedDocument, PersistenceGateway};

/// Where a delta came from, relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Submitted by a client connected to this process.
    Local,
    /// Already merged here; being passed on to other replicas.
    Remote,
}

/// Yrs v1 update bytes tagged with their origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub payload: Vec<u8>,
    pub origin: Origin,
}

impl Delta {
    pub fn local(payload: Vec<u8>) -> Self {
        Self {
            payload,
            origin: Origin::Local,
        }
    }

    pub fn remote(payload: Vec<u8>) -> Self {
        Self {
            payload,
            origin: Origin::Remote,
        }
    }
}

/// Receives deltas that were merged locally and must reach other replicas.
pub trait DeltaSink: Send + Sync {
    fn forward(&self, document_id: &DocumentId, delta: Delta);
}

/// Replica errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaError {
    /// Delta bytes could not be decoded or applied
    MalformedDelta(String),
    /// Operation on a document that has no resident replica
    NotResident(DocumentId),
    /// Remote state vector could not be decoded
    MalformedStateVector(String),
}

impl fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedDelta(e) => write!(f, "Malformed delta: {e}"),
            Self::NotResident(id) => write!(f, "Document not resident: {id}"),
            Self::MalformedStateVector(e) => write!(f, "Malformed state vector: {e}"),
        }
    }
}

impl std::error::Error for ReplicaError {}

/// One document's CRDT state.
pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn empty() -> Self {
        Self { doc: Doc::new() }
    }

    /// Materialize a replica from a full-state update.
    pub fn from_update(bytes: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::empty();
        replica.apply(bytes)?;
        Ok(replica)
    }

    /// Build a replica whose projection equals `content`.
    pub fn from_content(content: &ReportDocument) -> Self {
        let replica = Self::empty();
        {
            let mut txn = replica.doc.transact_mut();
            schema::write_report(&mut txn, content);
        }
        replica
    }

    /// Merge a delta. Merging the same delta twice is a no-op.
    pub fn apply(&self, delta: &[u8]) -> Result<(), ReplicaError> {
        let update =
            Update::decode_v1(delta).map_err(|e| ReplicaError::MalformedDelta(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ReplicaError::MalformedDelta(e.to_string()))
    }

    /// Full state encoded as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// True until the replica has incorporated at least one change.
    pub fn is_empty(&self) -> bool {
        self.doc.transact().state_vector().is_empty()
    }

    /// Everything this replica has that a peer at `remote_state_vector` lacks.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ReplicaError::MalformedStateVector(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    pub fn content(&self) -> ReportDocument {
        schema::read_report(&self.doc.transact())
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    fn materialize(document_id: &DocumentId, persisted: PersistedDocument) -> Self {
        if let Some(bytes) = persisted.binary_replica.filter(|b| !b.is_empty()) {
            match Self::from_update(&bytes) {
                Ok(replica) => return replica,
                Err(e) => warn!(
                    "Stored replica of {document_id} is unreadable ({e}), falling back to snapshot"
                ),
            }
        }
        match persisted.plain_snapshot {
            Some(snapshot) => {
                info!("Rebuilding {document_id} from plain snapshot");
                Self::from_content(&snapshot)
            }
            None => Self::empty(),
        }
    }
}

/// Registry of resident replicas, keyed by document id.
pub struct ReplicaStore {
    replicas: RwLock<HashMap<DocumentId, Arc<Replica>>>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl ReplicaStore {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            gateway,
        }
    }

    /// Return the resident replica, loading it through the gateway if needed.
    pub async fn obtain(&self, document_id: &DocumentId) -> Arc<Replica> {
        if let Some(replica) = self.replicas.read().await.get(document_id) {
            return replica.clone();
        }

        let replica = match self.gateway.load(document_id).await {
            Ok(persisted) => Replica::materialize(document_id, persisted),
            Err(e) => {
                warn!("Loading {document_id} failed ({e}), starting from an empty document");
                Replica::empty()
            }
        };

        let mut replicas = self.replicas.write().await;
        let replica = replicas
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(replica))
            .clone();
        info!("Document {document_id} resident ({} open)", replicas.len());
        replica
    }

    /// Merge a client delta and hand it, tagged [`Origin::Remote`], to `sink`.
    ///
    /// Nothing is forwarded when the delta does not merge.
    pub async fn apply_local(
        &self,
        document_id: &DocumentId,
        payload: Vec<u8>,
        sink: &dyn DeltaSink,
    ) -> Result<(), ReplicaError> {
        let replica = self.resident(document_id).await?;
        replica.apply(&payload)?;
        debug!("Merged {} byte delta into {document_id}", payload.len());
        sink.forward(document_id, Delta::remote(payload));
        Ok(())
    }

    /// Merge a delta without forwarding it anywhere.
    pub async fn apply_remote(
        &self,
        document_id: &DocumentId,
        payload: &[u8],
    ) -> Result<(), ReplicaError> {
        self.resident(document_id).await?.apply(payload)
    }

    /// Full state, or `None` for a document without any changes.
    pub async fn snapshot(&self, document_id: &DocumentId) -> Result<Option<Vec<u8>>, ReplicaError> {
        let replica = self.resident(document_id).await?;
        if replica.is_empty() {
            return Ok(None);
        }
        Ok(Some(replica.encode_state()))
    }

    pub async fn state_vector(&self, document_id: &DocumentId) -> Result<Vec<u8>, ReplicaError> {
        Ok(self.resident(document_id).await?.state_vector())
    }

    pub async fn diff(
        &self,
        document_id: &DocumentId,
        remote_state_vector: &[u8],
    ) -> Result<Vec<u8>, ReplicaError> {
        self.resident(document_id).await?.diff(remote_state_vector)
    }

    pub async fn content(&self, document_id: &DocumentId) -> Result<ReportDocument, ReplicaError> {
        Ok(self.resident(document_id).await?.content())
    }

    /// Evict a replica. Returns whether it was resident.
    pub async fn release(&self, document_id: &DocumentId) -> bool {
        let removed = self.replicas.write().await.remove(document_id).is_some();
        if removed {
            info!("Document {document_id} released");
        }
        removed
    }

    pub async fn replica(&self, document_id: &DocumentId) -> Option<Arc<Replica>> {
        self.replicas.read().await.get(document_id).cloned()
    }

    pub async fn is_resident(&self, document_id: &DocumentId) -> bool {
        self.replicas.read().await.contains_key(document_id)
    }

    pub async fn resident_count(&self) -> usize {
        self.replicas.read().await.len()
    }

    async fn resident(&self, document_id: &DocumentId) -> Result<Arc<Replica>, ReplicaError> {
        self.replica(document_id)
            .await
            .ok_or_else(|| ReplicaError::NotResident(document_id.clone()))
    }
}
