//! Advisory exclusive document locks.
//!
//! A lock does not stop anyone from joining or moving their cursor. While a
//! lock is held, the session layer refuses document updates from everyone
//! but the holder.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::ids::{now_millis, DocumentId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLock {
    pub document_id: DocumentId,
    pub holder: UserId,
    /// Milliseconds since the UNIX epoch.
    pub acquired_at: u64,
}

/// Lock errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LockError {
    /// Another user holds the lock
    Conflict { holder: UserId },
    /// Caller may not release a lock held by someone else
    Forbidden { holder: UserId },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { holder } => write!(f, "Document is locked by {holder}"),
            Self::Forbidden { holder } => {
                write!(f, "Only {holder} or a privileged user can unlock this document")
            }
        }
    }
}

impl std::error::Error for LockError {}

#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<DocumentId, DocumentLock>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock. Succeeds unchanged if `user` already holds it.
    pub fn acquire(
        &self,
        document_id: &DocumentId,
        user_id: &UserId,
    ) -> Result<DocumentLock, LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(document_id) {
            if &lock.holder == user_id {
                return Ok(lock.clone());
            }
            return Err(LockError::Conflict {
                holder: lock.holder.clone(),
            });
        }
        let lock = DocumentLock {
            document_id: document_id.clone(),
            holder: user_id.clone(),
            acquired_at: now_millis(),
        };
        locks.insert(document_id.clone(), lock.clone());
        Ok(lock)
    }

    /// Give the lock up. Releasing an unheld lock is a no-op.
    pub fn release(
        &self,
        document_id: &DocumentId,
        user_id: &UserId,
        privileged: bool,
    ) -> Result<(), LockError> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(document_id) {
            None => Ok(()),
            Some(lock) if &lock.holder == user_id || privileged => {
                locks.remove(document_id);
                Ok(())
            }
            Some(lock) => Err(LockError::Forbidden {
                holder: lock.holder.clone(),
            }),
        }
    }

    pub fn holder(&self, document_id: &DocumentId) -> Option<UserId> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .map(|lock| lock.holder.clone())
    }

    /// The holder, if the document is locked by someone other than `user_id`.
    pub fn blocks(&self, document_id: &DocumentId, user_id: &UserId) -> Option<UserId> {
        self.holder(document_id).filter(|holder| holder != user_id)
    }

    /// Drop the lock regardless of holder (document cleanup).
    pub fn clear(&self, document_id: &DocumentId) -> Option<DocumentLock> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::from("D1")
    }

    #[test]
    fn test_acquire_and_conflict() {
        let locks = LockRegistry::new();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let lock = locks.acquire(&doc(), &alice).unwrap();
        assert_eq!(lock.holder, alice);
        assert_eq!(
            locks.acquire(&doc(), &bob),
            Err(LockError::Conflict { holder: alice.clone() })
        );
        assert_eq!(locks.blocks(&doc(), &bob), Some(alice.clone()));
        assert_eq!(locks.blocks(&doc(), &alice), None);
    }

    #[test]
    fn test_reacquire_by_holder_keeps_lock() {
        let locks = LockRegistry::new();
        let alice = UserId::from("alice");
        let first = locks.acquire(&doc(), &alice).unwrap();
        let second = locks.acquire(&doc(), &alice).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_release_rules() {
        let locks = LockRegistry::new();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        // Unheld lock
        assert!(locks.release(&doc(), &bob, false).is_ok());

        locks.acquire(&doc(), &alice).unwrap();
        assert_eq!(
            locks.release(&doc(), &bob, false),
            Err(LockError::Forbidden { holder: alice.clone() })
        );
        assert!(locks.release(&doc(), &bob, true).is_ok());
        assert_eq!(locks.holder(&doc()), None);

        locks.acquire(&doc(), &alice).unwrap();
        assert!(locks.release(&doc(), &alice, false).is_ok());
        assert_eq!(locks.blocks(&doc(), &bob), None);
    }

    #[test]
    fn test_clear() {
        let locks = LockRegistry::new();
        locks.acquire(&doc(), &UserId::from("alice")).unwrap();
        assert!(locks.clear(&doc()).is_some());
        assert!(locks.clear(&doc()).is_none());
    }
}
