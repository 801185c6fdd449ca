//! Per-key ledger locks.
//!
//! Every read-modify-write of a user's batches runs while holding that
//! user's lock, so two debits for the same user serialize while debits for
//! different users never contend. Pending tips are guarded by a lock on the
//! external handle.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use cogbill_core::UserId;

/// A lockable ledger key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// A user's batch set.
    User(UserId),
    /// The pending tips and link of an external handle.
    Handle(String),
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Handle(handle) => write!(f, "handle:{handle}"),
        }
    }
}

type Table = DashMap<LockKey, Arc<Mutex<()>>>;

/// A held key. Dropping it releases the key, and removes the table entry
/// when nobody else is holding or waiting on it.
#[derive(Debug)]
pub struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    table: Arc<Table>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own reference left. Acquirers clone under the
        // same shard lock, so none can slip in between.
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Guards held by an open transaction. Dropping them releases the keys.
pub type LockGuards = Vec<KeyGuard>;

/// Table of async mutexes keyed by [`LockKey`].
///
/// Entries live only while a key is held or awaited.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Arc<Table>,
}

impl LockTable {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key in `keys`.
    ///
    /// Keys are sorted and deduplicated first so two transactions locking
    /// overlapping sets can never deadlock.
    pub async fn acquire(&self, keys: &[LockKey]) -> LockGuards {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            // Clone the mutex out so no shard lock is held across the await.
            let mutex = self.locks.entry(key.clone()).or_default().clone();
            let guard = mutex.lock_owned().await;
            guards.push(KeyGuard {
                guard: Some(guard),
                key,
                table: Arc::clone(&self.locks),
            });
        }
        guards
    }

    /// Drop entries nobody is holding or waiting on.
    ///
    /// Guards clean up after themselves; this only catches entries left by
    /// an `acquire` that was cancelled while waiting.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
