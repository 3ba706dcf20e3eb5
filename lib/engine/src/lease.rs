//! Per-conversation leases.
//!
//! Every engine operation on a conversation holds its lease, so `start`,
//! `resume`, `recover` and the operator actions never interleave for one
//! (flow, user) key. Unrelated keys never contend. Entries are removed when
//! the last holder or waiter goes away.

use replyflow_conversation::ConversationKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LeaseMap = HashMap<ConversationKey, Arc<AsyncMutex<()>>>;

/// Keyed async mutexes for conversations.
#[derive(Debug, Default, Clone)]
pub struct ConversationLocks {
    locks: Arc<Mutex<LeaseMap>>,
}

impl ConversationLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn acquire(&self, key: &ConversationKey) -> ConversationLease {
        let lock = {
            let mut locks = self.table();
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        ConversationLease {
            key: key.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Returns true if no key is held or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, LeaseMap> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to one conversation; released on drop.
#[derive(Debug)]
pub struct ConversationLease {
    key: ConversationKey,
    locks: Arc<Mutex<LeaseMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationLease {
    /// The leased conversation.
    #[must_use]
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the table, one in this guard: nobody else waits.
        if Arc::strong_count(OwnedMutexGuard::mutex(&guard)) == 2 {
            locks.remove(&self.key);
        }
        drop(guard);
    }
}
