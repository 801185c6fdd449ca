//! In-memory storage implementation.
//!
//! All state sits behind one `RwLock`, so [`LedgerStore::apply`] is a single
//! exclusive section and every read is a consistent snapshot.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cogbill_core::{BatchId, CorrelationId, CreditBatch, Job, PendingTip, UserId};

use crate::error::{Result, StoreError};
use crate::locks::LockTable;
use crate::{LedgerStore, WriteSet};

#[derive(Debug, Default)]
struct Inner {
    batches: HashMap<BatchId, CreditBatch>,
    batches_by_user: HashMap<UserId, BTreeSet<BatchId>>,
    pending: HashMap<String, Vec<PendingTip>>,
    links: HashMap<String, UserId>,
    jobs: HashMap<CorrelationId, Job>,
}

/// Process-local ledger store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    locks: LockTable,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl LedgerStore for MemoryStore {
    fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn user_batches(&self, user_ids: &[UserId]) -> Result<Vec<CreditBatch>> {
        let inner = self.read()?;
        Ok(user_ids
            .iter()
            .filter_map(|user_id| inner.batches_by_user.get(user_id))
            .flatten()
            .filter_map(|id| inner.batches.get(id).cloned())
            .collect())
    }

    fn get_batch(&self, batch_id: &BatchId) -> Result<Option<CreditBatch>> {
        Ok(self.read()?.batches.get(batch_id).cloned())
    }

    fn pending_tips(&self, handle: &str) -> Result<Vec<PendingTip>> {
        Ok(self.read()?.pending.get(handle).cloned().unwrap_or_default())
    }

    fn linked_user(&self, handle: &str) -> Result<Option<UserId>> {
        Ok(self.read()?.links.get(handle).copied())
    }

    fn apply(&self, writes: WriteSet) -> Result<()> {
        let mut inner = self.write()?;

        for batch in writes.batches {
            inner
                .batches_by_user
                .entry(batch.user_id)
                .or_default()
                .insert(batch.id);
            inner.batches.insert(batch.id, batch);
        }
        for tip in writes.pending_puts {
            inner.pending.entry(tip.handle.clone()).or_default().push(tip);
        }
        for (handle, id) in writes.pending_deletes {
            if let Some(tips) = inner.pending.get_mut(&handle) {
                tips.retain(|t| t.id != id);
                if tips.is_empty() {
                    inner.pending.remove(&handle);
                }
            }
        }
        for (handle, user_id) in writes.links {
            inner.links.insert(handle, user_id);
        }

        Ok(())
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        self.write()?.jobs.insert(job.correlation_id, job.clone());
        Ok(())
    }

    fn get_job(&self, correlation_id: &CorrelationId) -> Result<Option<Job>> {
        Ok(self.read()?.jobs.get(correlation_id).cloned())
    }
}
