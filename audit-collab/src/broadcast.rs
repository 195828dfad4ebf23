//! Fan-out of server messages to the members of a document room.
//!
//! Every connection owns one bounded mpsc outbox. A broadcast encodes
//! nothing: it enqueues one shared `Arc<ServerMessage>` per member, and the
//! connection's writer task encodes it with that connection's codec.
//!
//! Sends never wait. When a member's outbox is full the message is dropped
//! for that member and counted. The member's next delivery is preceded by a
//! `resync-required` error so the client knows to catch up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use log::{trace, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::ids::{ConnectionId, DocumentId};
use crate::protocol::{ErrorCode, ServerMessage};

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Arc<ServerMessage>>;
/// Receiving half, drained by the connection's writer.
pub type OutboxReceiver = mpsc::Receiver<Arc<ServerMessage>>;

pub fn outbox(capacity: usize) -> (Outbox, OutboxReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Enqueue without waiting. Returns whether the message was queued.
pub fn deliver(connection_id: ConnectionId, outbox: &Outbox, msg: Arc<ServerMessage>) -> bool {
    match outbox.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!(
                "Outbox of {connection_id} is full, dropping {} message",
                msg.kind()
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            trace!("Outbox of {connection_id} is closed");
            false
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters, read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Member {
    connection_id: ConnectionId,
    outbox: Outbox,
    /// Set when a message to this member was dropped.
    lagged: AtomicBool,
}

impl Member {
    fn new(connection_id: ConnectionId, outbox: Outbox) -> Self {
        Self {
            connection_id,
            outbox,
            lagged: AtomicBool::new(false),
        }
    }

    fn send(&self, document_id: &DocumentId, msg: &Arc<ServerMessage>) -> bool {
        if self.lagged.load(Ordering::Relaxed) {
            let notice = ServerMessage::error(
                ErrorCode::ResyncRequired,
                format!("Messages for {document_id} were dropped"),
            );
            if !deliver(self.connection_id, &self.outbox, Arc::new(notice)) {
                return false;
            }
            self.lagged.store(false, Ordering::Relaxed);
        }
        let queued = deliver(self.connection_id, &self.outbox, msg.clone());
        if !queued {
            self.lagged.store(true, Ordering::Relaxed);
        }
        queued
    }
}

/// The members of one document room, in join order.
pub struct BroadcastGroup {
    document_id: DocumentId,
    members: RwLock<Vec<Member>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            members: RwLock::new(Vec::new()),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a member. Adding a connection twice replaces its outbox.
    pub fn add_member(&self, connection_id: ConnectionId, outbox: Outbox) {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        match members.iter_mut().find(|m| m.connection_id == connection_id) {
            Some(member) => *member = Member::new(connection_id, outbox),
            None => members.push(Member::new(connection_id, outbox)),
        }
    }

    pub fn remove_member(&self, connection_id: ConnectionId) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        let before = members.len();
        members.retain(|m| m.connection_id != connection_id);
        members.len() != before
    }

    /// Send `msg` to every member except `except`.
    ///
    /// Returns the number of members the message was queued for.
    pub fn broadcast(&self, msg: ServerMessage, except: Option<ConnectionId>) -> usize {
        let msg = Arc::new(msg);
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        for member in members.iter().filter(|m| Some(m.connection_id) != except) {
            if member.send(&self.document_id, &msg) {
                delivered += 1;
            } else {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn member_count(&self) -> usize {
        self.members.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn has_member(&self, connection_id: ConnectionId) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.connection_id == connection_id)
    }

    pub fn members(&self) -> Vec<ConnectionId> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| m.connection_id)
            .collect()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count(),
        }
    }
}

/// Room registry: maps document ids to broadcast groups.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the room for a document.
    pub fn get_or_create(&self, document_id: &DocumentId) -> Arc<BroadcastGroup> {
        if let Some(room) = self.get(document_id) {
            return room;
        }
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        rooms
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(document_id.clone())))
            .clone()
    }

    pub fn get(&self, document_id: &DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .cloned()
    }

    /// Remove a room that has no members left.
    pub fn remove_if_empty(&self, document_id: &DocumentId) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms
            .get(document_id)
            .is_some_and(|room| room.member_count() == 0)
        {
            rooms.remove(document_id);
            return true;
        }
        false
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

}
