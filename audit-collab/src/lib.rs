//! # audit-collab: Real-time collaborative editing for audit reports
//!
//! Several people edit the same report at once. Every open report has one
//! authoritative Yrs replica on the server; clients exchange CRDT deltas
//! with it over WebSocket, see each other's cursors, and the replica is
//! flushed to storage periodically and when the last editor leaves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per user)  │  bincode / JSON     │  └─ SessionRouter            │
//! └─────────────┘                     │      ├─ RoomRegistry (fan-out)│
//!                                     │      ├─ LockRegistry          │
//!                                     │      └─ CollaborationService  │
//!                                     │          ├─ ReplicaStore      │
//!                                     │          ├─ AwarenessTracker  │
//!                                     │          └─ AutoSaveScheduler │
//!                                     └──────────────┬───────────────┘
//!                                                    │
//!                                        PersistenceGateway (RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`replica`]: Per-document CRDT replicas
//! - [`presence`]: Who is editing what, with cursors and colors
//! - [`autosave`]: Periodic flushes of open documents
//! - [`lock`]: Advisory edit lock overlay
//! - [`service`]: Engine configuration and the document lifecycle
//! - [`session`]: Per-connection request handling
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`protocol`]: Wire messages and their two encodings
//! - [`storage`]: Persistence gateway and the RocksDB store
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client

pub mod autosave;
pub mod broadcast;
pub mod client;
pub mod ids;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod schema;
pub mod server;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use autosave::{AutoSaveScheduler, FlushError, FlushReceipt, Persister};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomRegistry};
pub use client::{ClientEvent, ConnectionState, PendingUpdates, SyncClient};
pub use ids::{ConnectionId, DocumentId, UserId};
pub use lock::{DocumentLock, LockError, LockRegistry};
pub use presence::{AwarenessTracker, PresenceEntry, PruneReport, SelectionRange};
pub use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage, WireCodec};
pub use replica::{Delta, DeltaSink, Origin, Replica, ReplicaError, ReplicaStore};
pub use schema::{ReportDocument, Section};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{CollabConfig, CollaborationService, DocumentGates};
pub use session::{AllowAll, Authorizer, SessionError, SessionRouter, StaticAuthorizer};
pub use storage::{
    AnnotationSink, CommentRecord, DocumentMetadata, DocumentStore, MemoryGateway, NewComment,
    PersistedDocument, PersistenceError, PersistenceGateway, RocksGateway, StoreConfig,
    StoreError,
};
