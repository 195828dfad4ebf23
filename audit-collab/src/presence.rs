//! Presence awareness: who is in which document, where their cursor is.
//!
//! ## Architecture
//!
//! ```text
//! join / cursor / update
//!       │
//!       ▼
//! AwarenessTracker::{join, update_cursor, touch}
//!       │  (refreshes last_active_at)
//!       ▼
//! per-document entry list (join order)
//!       │
//!       ▼   periodic sweep
//! AwarenessTracker::prune_inactive()
//!       │
//!       ▼
//! PruneReport { removed, emptied }  ──► session cleanup
//! ```
//!
//! Presence is ephemeral: it is never persisted and disappears with the
//! process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::ids::{now_millis, DocumentId, UserId};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Collaborator colors, handed out in this order.
pub const PALETTE: [&str; 8] = [
    "#E57373", "#64B5F6", "#81C784", "#FFB74D", "#BA68C8", "#4DB6AC", "#F06292", "#90A4AE",
];

/// A text selection, as character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: u64,
    pub head: u64,
}

/// One collaborator's presence in one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    /// Hex color from [`PALETTE`].
    pub color: String,
    pub cursor: Option<u64>,
    pub selection: Option<SelectionRange>,
    /// Milliseconds since the UNIX epoch.
    pub last_active_at: u64,
}

/// Outcome of an inactivity sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    /// Entries removed, grouped by document.
    pub removed: Vec<(DocumentId, Vec<PresenceEntry>)>,
    /// Documents that have no collaborators left.
    pub emptied: Vec<DocumentId>,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.iter().map(|(_, entries)| entries.len()).sum()
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Presence state for every open document.
#[derive(Default)]
pub struct AwarenessTracker {
    documents: Mutex<HashMap<DocumentId, Vec<PresenceEntry>>>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `user` to a document, or refresh them if already present.
    ///
    /// A re-join keeps the user's color and position in the list.
    pub fn join(
        &self,
        document_id: &DocumentId,
        user_id: &UserId,
        display_name: &str,
    ) -> Vec<PresenceEntry> {
        self.with_documents(|documents| {
            let entries = documents.entry(document_id.clone()).or_default();
            let now = now_millis();

            if let Some(entry) = entries.iter_mut().find(|e| &e.user_id == user_id) {
                entry.display_name = display_name.to_string();
                entry.last_active_at = now;
            } else {
                let color = pick_color(entries);
                entries.push(PresenceEntry {
                    user_id: user_id.clone(),
                    display_name: display_name.to_string(),
                    color,
                    cursor: None,
                    selection: None,
                    last_active_at: now,
                });
            }
            entries.clone()
        })
    }

    /// Remove `user` from a document. An empty result means nobody is left.
    pub fn leave(&self, document_id: &DocumentId, user_id: &UserId) -> Vec<PresenceEntry> {
        self.with_documents(|documents| {
            let Some(entries) = documents.get_mut(document_id) else {
                return Vec::new();
            };
            entries.retain(|e| &e.user_id != user_id);
            let remaining = entries.clone();
            if remaining.is_empty() {
                documents.remove(document_id);
            }
            remaining
        })
    }

    /// Record a cursor move. No-op if the user is not present.
    pub fn update_cursor(
        &self,
        document_id: &DocumentId,
        user_id: &UserId,
        cursor: Option<u64>,
        selection: Option<SelectionRange>,
    ) -> Vec<PresenceEntry> {
        self.with_documents(|documents| {
            let Some(entries) = documents.get_mut(document_id) else {
                return Vec::new();
            };
            if let Some(entry) = entries.iter_mut().find(|e| &e.user_id == user_id) {
                entry.cursor = cursor;
                entry.selection = selection;
                entry.last_active_at = now_millis();
            }
            entries.clone()
        })
    }

    /// Mark `user` active without changing their cursor.
    pub fn touch(&self, document_id: &DocumentId, user_id: &UserId) {
        self.with_documents(|documents| {
            if let Some(entry) = documents
                .get_mut(document_id)
                .and_then(|entries| entries.iter_mut().find(|e| &e.user_id == user_id))
            {
                entry.last_active_at = now_millis();
            }
        });
    }

    pub fn entry(&self, document_id: &DocumentId, user_id: &UserId) -> Option<PresenceEntry> {
        self.with_documents(|documents| {
            documents
                .get(document_id)?
                .iter()
                .find(|e| &e.user_id == user_id)
                .cloned()
        })
    }

    /// Collaborators of a document, in join order.
    pub fn list(&self, document_id: &DocumentId) -> Vec<PresenceEntry> {
        self.with_documents(|documents| documents.get(document_id).cloned().unwrap_or_default())
    }

    pub fn document_count(&self) -> usize {
        self.with_documents(|documents| documents.len())
    }

    /// Drop entries idle for longer than `timeout`, across all documents.
    pub fn prune_inactive(&self, timeout: Duration) -> PruneReport {
        self.prune_inactive_at(now_millis(), timeout)
    }

    /// [`Self::prune_inactive`] against an explicit clock reading.
    pub fn prune_inactive_at(&self, now: u64, timeout: Duration) -> PruneReport {
        let cutoff = now.saturating_sub(timeout.as_millis() as u64);
        self.with_documents(|documents| {
            let mut report = PruneReport::default();
            documents.retain(|document_id, entries| {
                let (stale, fresh): (Vec<_>, Vec<_>) = entries
                    .drain(..)
                    .partition(|e| e.last_active_at < cutoff);
                *entries = fresh;
                if !stale.is_empty() {
                    report.removed.push((document_id.clone(), stale));
                    if entries.is_empty() {
                        report.emptied.push(document_id.clone());
                    }
                }
                !entries.is_empty()
            });
            report
        })
    }

    fn with_documents<R>(
        &self,
        f: impl FnOnce(&mut HashMap<DocumentId, Vec<PresenceEntry>>) -> R,
    ) -> R {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut documents)
    }
}

/// First palette color nobody in the document uses, else a random one.
fn pick_color(entries: &[PresenceEntry]) -> String {
    PALETTE
        .iter()
        .find(|color| !entries.iter().any(|e| e.color == **color))
        .or_else(|| PALETTE.choose(&mut rand::thread_rng()))
        .unwrap_or(&PALETTE[0])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::from("D1")
    }

    fn user(n: usize) -> UserId {
        UserId::new(format!("user-{n}"))
    }

    #[test]
    fn test_join_assigns_first_free_color() {
        let tracker = AwarenessTracker::new();
        let list = tracker.join(&doc(), &user(1), "Ann");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].color, PALETTE[0]);

        let list = tracker.join(&doc(), &user(2), "Ben");
        assert_eq!(list[1].color, PALETTE[1]);
    }

    #[test]
    fn test_freed_color_is_reused() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        tracker.join(&doc(), &user(2), "Ben");
        tracker.leave(&doc(), &user(1));

        let list = tracker.join(&doc(), &user(3), "Cat");
        assert_eq!(list.last().unwrap().color, PALETTE[0]);
    }

    #[test]
    fn test_eight_unique_colors_then_palette_reuse() {
        let tracker = AwarenessTracker::new();
        for n in 0..8 {
            tracker.join(&doc(), &user(n), "someone");
        }
        let list = tracker.list(&doc());
        let mut colors: Vec<&str> = list.iter().map(|e| e.color.as_str()).collect();
        colors.sort();
        colors.dedup();
        assert_eq!(colors.len(), 8);

        let list = tracker.join(&doc(), &user(8), "ninth");
        assert_eq!(list.len(), 9);
        assert!(PALETTE.contains(&list[8].color.as_str()));
    }

    #[test]
    fn test_colors_are_per_document() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        let other = tracker.join(&DocumentId::from("D2"), &user(2), "Ben");
        assert_eq!(other[0].color, PALETTE[0]);
    }

    #[test]
    fn test_rejoin_keeps_color_and_order() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        tracker.join(&doc(), &user(2), "Ben");

        let list = tracker.join(&doc(), &user(1), "Ann B.");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].user_id, user(1));
        assert_eq!(list[0].display_name, "Ann B.");
        assert_eq!(list[0].color, PALETTE[0]);
    }

    #[test]
    fn test_leave_last_user_empties_document() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        assert!(tracker.leave(&doc(), &user(1)).is_empty());
        assert_eq!(tracker.document_count(), 0);
        assert!(tracker.leave(&doc(), &user(1)).is_empty());
    }

    #[test]
    fn test_update_cursor() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        let selection = SelectionRange { anchor: 4, head: 9 };

        let list = tracker.update_cursor(&doc(), &user(1), Some(9), Some(selection));
        assert_eq!(list[0].cursor, Some(9));
        assert_eq!(list[0].selection, Some(selection));
    }

    #[test]
    fn test_update_cursor_for_absent_user_is_noop() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        let list = tracker.update_cursor(&doc(), &user(2), Some(3), None);
        assert_eq!(list.len(), 1);
        assert!(tracker.entry(&doc(), &user(2)).is_none());
        assert!(tracker
            .update_cursor(&DocumentId::from("D9"), &user(1), None, None)
            .is_empty());
    }

    #[test]
    fn test_prune_removes_only_stale_entries() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        tracker.join(&DocumentId::from("D2"), &user(2), "Ben");
        let now = now_millis();

        // Nothing is older than a minute yet
        let report = tracker.prune_inactive_at(now, Duration::from_secs(60));
        assert!(report.is_empty());

        let later = now + 120_000;
        tracker.with_documents(|documents| {
            documents.get_mut(&DocumentId::from("D2")).unwrap()[0].last_active_at = later;
        });

        let report = tracker.prune_inactive_at(later, Duration::from_secs(60));
        assert_eq!(report.removed_count(), 1);
        assert_eq!(report.removed[0].0, doc());
        assert_eq!(report.emptied, vec![doc()]);
        assert!(tracker.list(&doc()).is_empty());
        assert_eq!(tracker.list(&DocumentId::from("D2")).len(), 1);
    }

    #[test]
    fn test_prune_partial_document_is_not_emptied() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        tracker.join(&doc(), &user(2), "Ben");
        let later = now_millis() + 120_000;
        tracker.with_documents(|documents| {
            documents.get_mut(&doc()).unwrap()[1].last_active_at = later;
        });

        let report = tracker.prune_inactive_at(later, Duration::from_secs(60));
        assert_eq!(report.removed_count(), 1);
        assert!(report.emptied.is_empty());
        assert_eq!(tracker.list(&doc())[0].user_id, user(2));
    }

    #[test]
    fn test_touch_refreshes_activity() {
        let tracker = AwarenessTracker::new();
        tracker.join(&doc(), &user(1), "Ann");
        tracker.with_documents(|documents| {
            documents.get_mut(&doc()).unwrap()[0].last_active_at = 0;
        });

        tracker.touch(&doc(), &user(1));
        assert!(tracker.entry(&doc(), &user(1)).unwrap().last_active_at > 0);
    }
}
