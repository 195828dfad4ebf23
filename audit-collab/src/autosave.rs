//! Periodic persistence of open documents.
//!
//! Every open document gets one timer task. On each tick the task takes the
//! document's gate, encodes the replica and hands replica bytes plus the
//! plain projection to the [`PersistenceGateway`]. A failed save is logged
//! and the timer keeps going.
//!
//! Timer tasks are owned through [`AutoSaveHandle`], which aborts the task
//! when dropped, so a document's timer never outlives its registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::ids::{now_millis, DocumentId};
use crate::replica::ReplicaStore;
use crate::service::DocumentGates;
use crate::storage::{PersistenceError, PersistenceGateway};

/// What a successful flush wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReceipt {
    pub document_id: DocumentId,
    /// Size of the saved replica in bytes.
    pub bytes: usize,
    /// Milliseconds since the UNIX epoch.
    pub saved_at: u64,
}

/// Flush errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushError {
    /// Nothing to flush: the document is not open
    NotResident(DocumentId),
    /// The gateway refused the save
    Persistence(PersistenceError),
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotResident(id) => write!(f, "Document not resident: {id}"),
            Self::Persistence(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FlushError {}

impl From<PersistenceError> for FlushError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}

/// Encodes a resident replica and saves it through the gateway.
pub struct Persister {
    replicas: Arc<ReplicaStore>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl Persister {
    pub fn new(replicas: Arc<ReplicaStore>, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { replicas, gateway }
    }

    pub async fn flush(&self, document_id: &DocumentId) -> Result<FlushReceipt, FlushError> {
        let replica = self
            .replicas
            .replica(document_id)
            .await
            .ok_or_else(|| FlushError::NotResident(document_id.clone()))?;

        // An unchanged document still encodes to a valid (empty) update
        let bytes = replica.encode_state();
        let content = replica.content();
        let size = bytes.len();

        self.gateway.save(document_id, bytes, content).await?;
        Ok(FlushReceipt {
            document_id: document_id.clone(),
            bytes: size,
            saved_at: now_millis(),
        })
    }
}

/// Owns one document's timer task. Dropping the handle aborts the task.
pub struct AutoSaveHandle {
    task: JoinHandle<()>,
}

impl Drop for AutoSaveHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct AutoSaveScheduler {
    persister: Arc<Persister>,
    gates: Arc<DocumentGates>,
    tasks: Mutex<HashMap<DocumentId, AutoSaveHandle>>,
}

impl AutoSaveScheduler {
    pub fn new(persister: Arc<Persister>, gates: Arc<DocumentGates>) -> Self {
        Self {
            persister,
            gates,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start flushing `document_id` every `interval`, replacing any earlier
    /// timer for it. A zero interval disables autosave for the document.
    pub fn start(&self, document_id: &DocumentId, interval: Duration) {
        if interval.is_zero() {
            self.stop(document_id);
            return;
        }

        let persister = self.persister.clone();
        let gates = self.gates.clone();
        let id = document_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _gate = gates.enter(&id).await;
                match persister.flush(&id).await {
                    Ok(receipt) => debug!("Autosaved {id} ({} bytes)", receipt.bytes),
                    Err(FlushError::NotResident(_)) => debug!("Autosave skipped, {id} not open"),
                    Err(e) => error!("Autosave of {id} failed: {e}"),
                }
            }
        });

        let previous = self
            .tasks()
            .insert(document_id.clone(), AutoSaveHandle { task });
        if previous.is_none() {
            info!("Autosave started for {document_id} every {interval:?}");
        }
    }

    /// Stop the timer. Returns whether one was running.
    pub fn stop(&self, document_id: &DocumentId) -> bool {
        let stopped = self.tasks().remove(document_id).is_some();
        if stopped {
            debug!("Autosave stopped for {document_id}");
        }
        stopped
    }

    /// Flush immediately. The caller is expected to hold the document's gate.
    pub async fn flush_now(&self, document_id: &DocumentId) -> Result<FlushReceipt, FlushError> {
        self.persister.flush(document_id).await
    }

    pub fn is_scheduled(&self, document_id: &DocumentId) -> bool {
        self.tasks().contains_key(document_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.tasks().len()
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentId, AutoSaveHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::Replica;
    use crate::schema::ReportDocument;
    use crate::storage::MemoryGateway;

    struct Fixture {
        gateway: Arc<MemoryGateway>,
        replicas: Arc<ReplicaStore>,
        scheduler: AutoSaveScheduler,
    }

    fn fixture() -> Fixture {
        let gateway = Arc::new(MemoryGateway::new());
        let replicas = Arc::new(ReplicaStore::new(gateway.clone()));
        let persister = Arc::new(Persister::new(replicas.clone(), gateway.clone()));
        let scheduler = AutoSaveScheduler::new(persister, Arc::new(DocumentGates::default()));
        Fixture {
            gateway,
            replicas,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_flush_now_saves_replica_and_content() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        let report = ReportDocument::new("Cash procedures");
        f.replicas.obtain(&doc).await;
        f.replicas
            .apply_remote(&doc, &Replica::from_content(&report).encode_state())
            .await
            .unwrap();

        let receipt = f.scheduler.flush_now(&doc).await.unwrap();
        assert_eq!(receipt.document_id, doc);

        let stored = f.gateway.stored(&doc).unwrap();
        assert_eq!(stored.plain_snapshot, Some(report.clone()));
        let reloaded = Replica::from_update(&stored.binary_replica.unwrap()).unwrap();
        assert_eq!(reloaded.content(), report);
    }

    #[tokio::test]
    async fn test_flush_unchanged_document_saves_empty_state() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.replicas.obtain(&doc).await;

        f.scheduler.flush_now(&doc).await.unwrap();
        let stored = f.gateway.stored(&doc).unwrap();
        let reloaded = Replica::from_update(&stored.binary_replica.unwrap()).unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_flush_not_resident() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        assert_eq!(
            f.scheduler.flush_now(&doc).await,
            Err(FlushError::NotResident(doc))
        );
    }

    #[tokio::test]
    async fn test_flush_failure_is_reported() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.replicas.obtain(&doc).await;
        f.gateway.set_fail_saves(true);

        assert!(matches!(
            f.scheduler.flush_now(&doc).await,
            Err(FlushError::Persistence(PersistenceError::Unavailable(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_periodically() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.replicas.obtain(&doc).await;

        f.scheduler.start(&doc, Duration::from_secs(30));
        assert!(f.scheduler.is_scheduled(&doc));
        assert_eq!(f.gateway.save_count(&doc), 0);

        time::sleep(Duration::from_secs(95)).await;
        assert_eq!(f.gateway.save_count(&doc), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_survives_failed_saves() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.replicas.obtain(&doc).await;
        f.gateway.set_fail_saves(true);

        f.scheduler.start(&doc, Duration::from_secs(10));
        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(f.gateway.save_count(&doc), 0);

        f.gateway.set_fail_saves(false);
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.gateway.save_count(&doc), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_halts_timer() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.replicas.obtain(&doc).await;

        f.scheduler.start(&doc, Duration::from_secs(10));
        assert!(f.scheduler.stop(&doc));
        assert!(!f.scheduler.stop(&doc));

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.gateway.save_count(&doc), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_timer() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.replicas.obtain(&doc).await;

        f.scheduler.start(&doc, Duration::from_secs(10));
        f.scheduler.start(&doc, Duration::from_secs(10));
        assert_eq!(f.scheduler.scheduled_count(), 1);

        time::sleep(Duration::from_secs(15)).await;
        assert_eq!(f.gateway.save_count(&doc), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_disables_autosave() {
        let f = fixture();
        let doc = DocumentId::from("D1");
        f.scheduler.start(&doc, Duration::ZERO);
        assert!(!f.scheduler.is_scheduled(&doc));
    }
}
