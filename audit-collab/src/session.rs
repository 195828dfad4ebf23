//! Session router: binds connections to documents and routes their messages.
//!
//! ```text
//!            connect                join(doc)               leave / disconnect
//! ─────────► Unbound ──────────────────────────► Bound(doc) ──────────────────► Unbound
//!                ▲                                   │ join(other)
//!                └───────── implicit leave ──────────┘
//! ```
//!
//! Every operation on a document runs under that document's gate, so
//! replica merges, presence changes, flushes and the broadcasts they cause
//! happen in one order per document. Replies and broadcasts go through each
//! connection's bounded outbox and never wait.
//!
//! Cleanup (final flush, stop autosave, release the replica, drop the lock)
//! runs when the last collaborator leaves a document, either explicitly or
//! through the inactivity sweep. A connection that is still bound after a
//! sweep closed its document re-opens it on its next message.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};

use crate::broadcast::{deliver, BroadcastGroup, Outbox, RoomRegistry};
use crate::ids::{now_millis, ConnectionId, DocumentId, UserId};
use crate::lock::LockError;
use crate::presence::{PruneReport, SelectionRange};
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::replica::{Delta, DeltaSink, ReplicaError};
use crate::service::CollaborationService;
use crate::storage::NewComment;

// ───────────────────────────────────────────────────────────────────
// Authorization
// ───────────────────────────────────────────────────────────────────

/// Membership checks, answered by the surrounding platform.
pub trait Authorizer: Send + Sync {
    fn can_join<'a>(&'a self, user_id: &'a UserId, document_id: &'a DocumentId)
        -> BoxFuture<'a, bool>;

    /// Privileged users may release locks held by others.
    fn is_privileged<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, bool>;
}

/// Lets everyone join every document. Nobody is privileged.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_join<'a>(&'a self, _: &'a UserId, _: &'a DocumentId) -> BoxFuture<'a, bool> {
        async { true }.boxed()
    }

    fn is_privileged<'a>(&'a self, _: &'a UserId) -> BoxFuture<'a, bool> {
        async { false }.boxed()
    }
}

/// Fixed membership table.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    members: HashMap<DocumentId, HashSet<UserId>>,
    privileged: HashSet<UserId>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, document_id: impl Into<DocumentId>, user_id: impl Into<UserId>) -> Self {
        self.members
            .entry(document_id.into())
            .or_default()
            .insert(user_id.into());
        self
    }

    /// Privileged users may join any document.
    pub fn privileged(mut self, user_id: impl Into<UserId>) -> Self {
        self.privileged.insert(user_id.into());
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn can_join<'a>(
        &'a self,
        user_id: &'a UserId,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, bool> {
        let allowed = self.privileged.contains(user_id)
            || self
                .members
                .get(document_id)
                .is_some_and(|users| users.contains(user_id));
        async move { allowed }.boxed()
    }

    fn is_privileged<'a>(&'a self, user_id: &'a UserId) -> BoxFuture<'a, bool> {
        let privileged = self.privileged.contains(user_id);
        async move { privileged }.boxed()
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Session errors. Each maps onto a protocol error code.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    UnknownConnection(ConnectionId),
    Unauthorized {
        user_id: UserId,
        document_id: DocumentId,
    },
    NotJoined,
    DocumentMismatch {
        bound: DocumentId,
        requested: DocumentId,
    },
    MalformedDelta(String),
    MalformedStateVector(String),
    DocumentLocked {
        holder: UserId,
    },
    Lock(LockError),
    CommentRejected(String),
    Replica(ReplicaError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownConnection(_) | Self::Replica(_) => ErrorCode::Internal,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::NotJoined => ErrorCode::NotJoined,
            Self::DocumentMismatch { .. } => ErrorCode::DocumentMismatch,
            Self::MalformedDelta(_) => ErrorCode::MalformedDelta,
            Self::MalformedStateVector(_) => ErrorCode::MalformedMessage,
            Self::DocumentLocked { .. } => ErrorCode::DocumentLocked,
            Self::Lock(LockError::Conflict { .. }) => ErrorCode::LockConflict,
            Self::Lock(LockError::Forbidden { .. }) => ErrorCode::LockForbidden,
            Self::CommentRejected(_) => ErrorCode::CommentRejected,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            Self::Unauthorized {
                user_id,
                document_id,
            } => write!(f, "{user_id} may not join {document_id}"),
            Self::NotJoined => write!(f, "Not joined to a document"),
            Self::DocumentMismatch { bound, requested } => {
                write!(f, "Joined to {bound}, not {requested}")
            }
            Self::MalformedDelta(e) => write!(f, "Malformed delta: {e}"),
            Self::MalformedStateVector(e) => write!(f, "Malformed state vector: {e}"),
            Self::DocumentLocked { holder } => write!(f, "Document is locked by {holder}"),
            Self::Lock(e) => write!(f, "{e}"),
            Self::CommentRejected(e) => write!(f, "Comment rejected: {e}"),
            Self::Replica(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ReplicaError> for SessionError {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::MalformedDelta(e) => Self::MalformedDelta(e),
            ReplicaError::MalformedStateVector(e) => Self::MalformedStateVector(e),
            other => Self::Replica(other),
        }
    }
}

impl From<LockError> for SessionError {
    fn from(e: LockError) -> Self {
        Self::Lock(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Router
// ───────────────────────────────────────────────────────────────────

struct Connection {
    user_id: UserId,
    display_name: String,
    outbox: Outbox,
    document: Option<DocumentId>,
}

/// Identity of a connection plus the document it is bound to.
struct Binding {
    user_id: UserId,
    display_name: String,
    document: Option<DocumentId>,
}

impl Binding {
    fn bound(self) -> Result<(UserId, String, DocumentId), SessionError> {
        match self.document {
            Some(document_id) => Ok((self.user_id, self.display_name, document_id)),
            None => Err(SessionError::NotJoined),
        }
    }
}

/// Rebroadcasts merged deltas to every room member but the sender.
struct RoomFanout<'a> {
    room: &'a BroadcastGroup,
    sender: ConnectionId,
    origin: &'a UserId,
}

impl DeltaSink for RoomFanout<'_> {
    fn forward(&self, document_id: &DocumentId, delta: Delta) {
        let delivered = self.room.broadcast(
            ServerMessage::Update {
                document_id: document_id.clone(),
                delta: delta.payload,
                origin: self.origin.clone(),
            },
            Some(self.sender),
        );
        debug!("Update on {document_id} from {} fanned out to {delivered}", self.origin);
    }
}

pub struct SessionRouter {
    service: Arc<CollaborationService>,
    authorizer: Arc<dyn Authorizer>,
    rooms: RoomRegistry,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
}

impl SessionRouter {
    pub fn new(service: Arc<CollaborationService>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            service,
            authorizer,
            rooms: RoomRegistry::new(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register an authenticated connection.
    pub fn connect(&self, user_id: UserId, display_name: impl Into<String>, outbox: Outbox) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let display_name = display_name.into();
        info!("Connection {connection_id} opened for {user_id} ({display_name})");
        self.connections().insert(
            connection_id,
            Connection {
                user_id,
                display_name,
                outbox,
                document: None,
            },
        );
        connection_id
    }

    /// Route one client message. Failures are also reported to the client
    /// as an `error` message.
    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        msg: ClientMessage,
    ) -> Result<(), SessionError> {
        let result = match msg {
            ClientMessage::Join { document_id } => self.join(connection_id, document_id).await,
            ClientMessage::Leave {} => self.leave(connection_id).await,
            ClientMessage::Update { document_id, delta } => {
                self.receive_update(connection_id, document_id, delta).await
            }
            ClientMessage::Cursor { cursor, selection } => {
                self.receive_cursor(connection_id, cursor, selection).await
            }
            ClientMessage::GetCollaborators {} => self.collaborators(connection_id),
            ClientMessage::Save {} => self.save(connection_id).await,
            ClientMessage::Resync { state_vector } => {
                self.request_resync(connection_id, state_vector).await
            }
            ClientMessage::Comment { text, position } => {
                self.comment(connection_id, text, position).await
            }
            ClientMessage::Lock {} => self.lock(connection_id).await,
            ClientMessage::Unlock {} => self.unlock(connection_id).await,
            ClientMessage::Ping { timestamp } => {
                self.reply(connection_id, ServerMessage::Pong { timestamp });
                Ok(())
            }
        };

        if let Err(e) = &result {
            match e {
                SessionError::MalformedDelta(_) => warn!("Dropping delta from {connection_id}: {e}"),
                _ => debug!("Request from {connection_id} failed: {e}"),
            }
            self.reply(connection_id, ServerMessage::error(e.code(), e.to_string()));
        }
        result
    }

    pub async fn join(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
    ) -> Result<(), SessionError> {
        let binding = self.binding(connection_id)?;
        if !self
            .authorizer
            .can_join(&binding.user_id, &document_id)
            .await
        {
            warn!("{} denied access to {document_id}", binding.user_id);
            return Err(SessionError::Unauthorized {
                user_id: binding.user_id,
                document_id,
            });
        }

        match &binding.document {
            // Joining the current document again is a resync
            Some(current) if *current == document_id => {
                return self.request_resync(connection_id, None).await;
            }
            Some(_) => self.leave(connection_id).await?,
            None => {}
        }

        let gate = self.service.enter(&document_id).await;
        let result = self
            .join_locked(connection_id, binding.user_id, &binding.display_name, &document_id)
            .await;
        self.service.exit(&document_id, gate);
        result
    }

    async fn join_locked(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: &str,
        document_id: &DocumentId,
    ) -> Result<(), SessionError> {
        let outbox = self.bind(connection_id, Some(document_id.clone()))?;
        let room = self.rooms.get_or_create(document_id);
        room.add_member(connection_id, outbox);

        let presence = self
            .service
            .awareness()
            .join(document_id, &user_id, display_name);
        self.service.open_document(document_id).await;

        let replicas = self.service.replicas();
        let state = replicas.snapshot(document_id).await?;
        let state_vector = replicas.state_vector(document_id).await?;

        self.reply(
            connection_id,
            ServerMessage::Sync {
                document_id: document_id.clone(),
                state,
                full: true,
                state_vector,
                presence: presence.clone(),
            },
        );
        if let Some(holder) = self.service.locks().holder(document_id) {
            self.reply(
                connection_id,
                ServerMessage::LockState {
                    document_id: document_id.clone(),
                    holder: Some(holder),
                },
            );
        }
        if let Some(entry) = presence.iter().find(|e| e.user_id == user_id).cloned() {
            room.broadcast(
                ServerMessage::UserJoined {
                    document_id: document_id.clone(),
                    user: entry,
                    presence,
                },
                Some(connection_id),
            );
        }

        info!("{user_id} joined {document_id} via {connection_id}");
        Ok(())
    }

    /// Unbind the connection from its document. Leaving while unbound is a
    /// no-op.
    pub async fn leave(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let binding = self.binding(connection_id)?;
        let Some(document_id) = binding.document else {
            return Ok(());
        };

        let gate = self.service.enter(&document_id).await;
        let result = self
            .leave_locked(
                connection_id,
                binding.user_id,
                binding.display_name,
                &document_id,
            )
            .await;
        self.service.exit(&document_id, gate);
        result
    }

    async fn leave_locked(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: String,
        document_id: &DocumentId,
    ) -> Result<(), SessionError> {
        self.bind(connection_id, None)?;
        let room = self.rooms.get(document_id);
        if let Some(room) = &room {
            room.remove_member(connection_id);
        }

        let awareness = self.service.awareness();
        let remaining = if self.user_still_bound(&user_id, document_id) {
            awareness.list(document_id)
        } else {
            let remaining = awareness.leave(document_id, &user_id);
            if let Some(room) = &room {
                room.broadcast(
                    ServerMessage::UserLeft {
                        document_id: document_id.clone(),
                        user_id: user_id.clone(),
                        display_name,
                        presence: remaining.clone(),
                    },
                    None,
                );
            }
            // A lock does not outlive its holder's presence
            if self.service.locks().holder(document_id).as_ref() == Some(&user_id) {
                self.service.locks().clear(document_id);
                self.broadcast_lock_state(document_id, None);
            }
            remaining
        };
        info!("{user_id} left {document_id} via {connection_id}");

        if remaining.is_empty() {
            self.cleanup(document_id).await;
        }
        Ok(())
    }

    pub async fn receive_update(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        delta: Vec<u8>,
    ) -> Result<(), SessionError> {
        let (user_id, display_name, bound) = self.binding(connection_id)?.bound()?;
        if bound != document_id {
            return Err(SessionError::DocumentMismatch {
                bound,
                requested: document_id,
            });
        }

        let gate = self.service.enter(&document_id).await;
        let result = self
            .update_locked(connection_id, user_id, &display_name, &document_id, delta)
            .await;
        self.service.exit(&document_id, gate);
        result
    }

    async fn update_locked(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: &str,
        document_id: &DocumentId,
        delta: Vec<u8>,
    ) -> Result<(), SessionError> {
        if let Some(holder) = self.service.locks().blocks(document_id, &user_id) {
            return Err(SessionError::DocumentLocked { holder });
        }
        let room = self
            .ensure_active(connection_id, &user_id, display_name, document_id)
            .await;
        let fanout = RoomFanout {
            room: &room,
            sender: connection_id,
            origin: &user_id,
        };
        self.service
            .apply_update(document_id, delta, &fanout)
            .await?;
        self.service.awareness().touch(document_id, &user_id);
        Ok(())
    }

    pub async fn receive_cursor(
        &self,
        connection_id: ConnectionId,
        cursor: Option<u64>,
        selection: Option<SelectionRange>,
    ) -> Result<(), SessionError> {
        let (user_id, display_name, document_id) = self.binding(connection_id)?.bound()?;

        let gate = self.service.enter(&document_id).await;
        let room = self
            .ensure_active(connection_id, &user_id, &display_name, &document_id)
            .await;
        let presence = self
            .service
            .awareness()
            .update_cursor(&document_id, &user_id, cursor, selection);
        if let Some(entry) = presence.into_iter().find(|e| e.user_id == user_id) {
            room.broadcast(
                ServerMessage::Cursor {
                    user_id: entry.user_id,
                    display_name: entry.display_name,
                    cursor: entry.cursor,
                    selection: entry.selection,
                    color: entry.color,
                },
                Some(connection_id),
            );
        }
        self.service.exit(&document_id, gate);
        Ok(())
    }

    pub fn collaborators(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let (_, _, document_id) = self.binding(connection_id)?.bound()?;
        let presence = self.service.awareness().list(&document_id);
        self.reply(connection_id, ServerMessage::Collaborators { presence });
        Ok(())
    }

    /// Flush now and tell the requester how it went.
    pub async fn save(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let (user_id, display_name, document_id) = self.binding(connection_id)?.bound()?;

        let gate = self.service.enter(&document_id).await;
        self.ensure_active(connection_id, &user_id, &display_name, &document_id)
            .await;
        let reply = match self.service.flush_now(&document_id).await {
            Ok(receipt) => ServerMessage::Saved {
                success: true,
                timestamp: receipt.saved_at,
            },
            Err(e) => {
                error!("Save of {document_id} requested by {user_id} failed: {e}");
                ServerMessage::Saved {
                    success: false,
                    timestamp: now_millis(),
                }
            }
        };
        self.reply(connection_id, reply);
        self.service.exit(&document_id, gate);
        Ok(())
    }

    /// Send the full state, or only what a client at `state_vector` misses.
    pub async fn request_resync(
        &self,
        connection_id: ConnectionId,
        state_vector: Option<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let (user_id, display_name, document_id) = self.binding(connection_id)?.bound()?;

        let gate = self.service.enter(&document_id).await;
        let result = self
            .resync_locked(connection_id, &user_id, &display_name, &document_id, state_vector)
            .await;
        self.service.exit(&document_id, gate);
        result
    }

    async fn resync_locked(
        &self,
        connection_id: ConnectionId,
        user_id: &UserId,
        display_name: &str,
        document_id: &DocumentId,
        state_vector: Option<Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.ensure_active(connection_id, user_id, display_name, document_id)
            .await;
        let replicas = self.service.replicas();
        let (state, full) = match state_vector {
            Some(remote) => (Some(replicas.diff(document_id, &remote).await?), false),
            None => (replicas.snapshot(document_id).await?, true),
        };
        let state_vector = replicas.state_vector(document_id).await?;
        self.reply(
            connection_id,
            ServerMessage::Sync {
                document_id: document_id.clone(),
                state,
                full,
                state_vector,
                presence: self.service.awareness().list(document_id),
            },
        );
        debug!("Resync of {document_id} for {connection_id} (full: {full})");
        Ok(())
    }

    /// Persist a comment and broadcast it to every member, sender included.
    pub async fn comment(
        &self,
        connection_id: ConnectionId,
        text: String,
        position: Option<u64>,
    ) -> Result<(), SessionError> {
        let (user_id, display_name, document_id) = self.binding(connection_id)?.bound()?;

        let gate = self.service.enter(&document_id).await;
        let result = self
            .service
            .record_comment(
                &document_id,
                NewComment {
                    author: user_id,
                    author_name: display_name,
                    text,
                    position,
                },
            )
            .await;
        let result = match result {
            Ok(comment) => {
                self.rooms
                    .get_or_create(&document_id)
                    .broadcast(ServerMessage::Comment { comment }, None);
                Ok(())
            }
            Err(e) => {
                error!("Comment on {document_id} could not be stored: {e}");
                Err(SessionError::CommentRejected(e.to_string()))
            }
        };
        self.service.exit(&document_id, gate);
        result
    }

    pub async fn lock(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let (user_id, _, document_id) = self.binding(connection_id)?.bound()?;

        let gate = self.service.enter(&document_id).await;
        let result = self
            .service
            .locks()
            .acquire(&document_id, &user_id)
            .map(|lock| {
                info!("{user_id} locked {document_id}");
                self.broadcast_lock_state(&document_id, Some(lock.holder));
            })
            .map_err(SessionError::from);
        self.service.exit(&document_id, gate);
        result
    }

    pub async fn unlock(&self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let (user_id, _, document_id) = self.binding(connection_id)?.bound()?;
        let privileged = self.authorizer.is_privileged(&user_id).await;

        let gate = self.service.enter(&document_id).await;
        let result = self
            .service
            .locks()
            .release(&document_id, &user_id, privileged)
            .map(|()| {
                info!("{user_id} unlocked {document_id}");
                self.broadcast_lock_state(&document_id, None);
            })
            .map_err(SessionError::from);
        self.service.exit(&document_id, gate);
        result
    }

    /// Leave the bound document, if any, and forget the connection.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        if let Err(e) = self.leave(connection_id).await {
            debug!("Leave on disconnect of {connection_id}: {e}");
        }
        if let Some(conn) = self.connections().remove(&connection_id) {
            info!("Connection {connection_id} of {} closed", conn.user_id);
        }
    }

    /// Drop idle collaborators everywhere and clean up emptied documents.
    pub async fn prune_inactive(&self) -> PruneReport {
        let timeout = self.service.config().presence_timeout;
        let report = self.service.awareness().prune_inactive(timeout);
        if report.is_empty() {
            return report;
        }
        info!(
            "Pruned {} idle collaborators, {} documents emptied",
            report.removed_count(),
            report.emptied.len()
        );

        for (document_id, removed) in &report.removed {
            let gate = self.service.enter(document_id).await;
            if let Some(room) = self.rooms.get(document_id) {
                let presence = self.service.awareness().list(document_id);
                for entry in removed {
                    room.broadcast(
                        ServerMessage::UserLeft {
                            document_id: document_id.clone(),
                            user_id: entry.user_id.clone(),
                            display_name: entry.display_name.clone(),
                            presence: presence.clone(),
                        },
                        None,
                    );
                }
            }
            // Someone may have joined between the sweep and taking the gate
            if report.emptied.contains(document_id)
                && self.service.awareness().list(document_id).is_empty()
            {
                self.cleanup(document_id).await;
            }
            self.service.exit(document_id, gate);
        }
        report
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// The document a connection is bound to.
    pub fn bound_document(&self, connection_id: ConnectionId) -> Option<DocumentId> {
        self.connections()
            .get(&connection_id)
            .and_then(|conn| conn.document.clone())
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn service(&self) -> &Arc<CollaborationService> {
        &self.service
    }

    /// Queue a message for one connection without waiting.
    pub fn reply(&self, connection_id: ConnectionId, msg: ServerMessage) {
        if let Some(outbox) = self.outbox(connection_id) {
            deliver(connection_id, &outbox, Arc::new(msg));
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    /// Final flush and release. Runs under the document's gate.
    async fn cleanup(&self, document_id: &DocumentId) {
        self.service.close_document(document_id).await;
        self.rooms.remove_if_empty(document_id);
    }

    /// Re-open a document a sweep closed while this connection stayed bound,
    /// and re-register the user's presence.
    async fn ensure_active(
        &self,
        connection_id: ConnectionId,
        user_id: &UserId,
        display_name: &str,
        document_id: &DocumentId,
    ) -> Arc<BroadcastGroup> {
        let room = self.rooms.get_or_create(document_id);
        if !room.has_member(connection_id) {
            if let Some(outbox) = self.outbox(connection_id) {
                room.add_member(connection_id, outbox);
            }
        }
        if !self.service.replicas().is_resident(document_id).await {
            info!("Re-opening {document_id} for {connection_id}");
            self.service.open_document(document_id).await;
        }

        let awareness = self.service.awareness();
        if awareness.entry(document_id, user_id).is_none() {
            let presence = awareness.join(document_id, user_id, display_name);
            if let Some(entry) = presence.iter().find(|e| &e.user_id == user_id).cloned() {
                room.broadcast(
                    ServerMessage::UserJoined {
                        document_id: document_id.clone(),
                        user: entry,
                        presence,
                    },
                    Some(connection_id),
                );
            }
        }
        room
    }

    fn broadcast_lock_state(&self, document_id: &DocumentId, holder: Option<UserId>) {
        self.rooms.get_or_create(document_id).broadcast(
            ServerMessage::LockState {
                document_id: document_id.clone(),
                holder,
            },
            None,
        );
    }

    fn user_still_bound(&self, user_id: &UserId, document_id: &DocumentId) -> bool {
        self.connections()
            .values()
            .any(|c| &c.user_id == user_id && c.document.as_ref() == Some(document_id))
    }

    fn binding(&self, connection_id: ConnectionId) -> Result<Binding, SessionError> {
        self.connections()
            .get(&connection_id)
            .map(|conn| Binding {
                user_id: conn.user_id.clone(),
                display_name: conn.display_name.clone(),
                document: conn.document.clone(),
            })
            .ok_or(SessionError::UnknownConnection(connection_id))
    }

    /// Set the connection's document. Returns its outbox.
    fn bind(
        &self,
        connection_id: ConnectionId,
        document: Option<DocumentId>,
    ) -> Result<Outbox, SessionError> {
        let mut connections = self.connections();
        let conn = connections
            .get_mut(&connection_id)
            .ok_or(SessionError::UnknownConnection(connection_id))?;
        conn.document = document;
        Ok(conn.outbox.clone())
    }

    fn outbox(&self, connection_id: ConnectionId) -> Option<Outbox> {
        self.connections()
            .get(&connection_id)
            .map(|conn| conn.outbox.clone())
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
