//! Ledger transactions.
//!
//! A [`LedgerTx`] is the unit of atomicity the ledger engine works in. It
//! holds the per-key locks it was opened with for its whole lifetime, reads
//! the store through its own staged writes, and hands everything to
//! [`LedgerStore::apply`] on commit. Dropping it uncommitted is a rollback.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use cogbill_core::{consumption_order, BatchId, CreditBatch, PendingTip, PendingTipId, UserId};

use crate::error::{Result, StoreError};
use crate::locks::{LockGuards, LockKey};
use crate::{LedgerStore, WriteSet};

/// An open ledger transaction.
pub struct LedgerTx<'a> {
    store: &'a dyn LedgerStore,
    held: Vec<LockKey>,
    _guards: LockGuards,
    batches: HashMap<BatchId, CreditBatch>,
    pending_puts: Vec<PendingTip>,
    pending_deletes: Vec<(String, PendingTipId)>,
    links: HashMap<String, UserId>,
}

impl<'a> LedgerTx<'a> {
    /// Open a transaction holding the locks for `keys`.
    ///
    /// Waits until every key is free; only transactions that share a key
    /// wait on each other.
    pub async fn begin(store: &'a dyn LedgerStore, keys: &[LockKey]) -> LedgerTx<'a> {
        let guards = store.locks().acquire(keys).await;
        Self {
            store,
            held: keys.to_vec(),
            _guards: guards,
            batches: HashMap::new(),
            pending_puts: Vec::new(),
            pending_deletes: Vec::new(),
            links: HashMap::new(),
        }
    }

    /// Whether this transaction holds `key`.
    #[must_use]
    pub fn holds(&self, key: &LockKey) -> bool {
        self.held.contains(key)
    }

    fn require(&self, key: &LockKey) -> Result<()> {
        if self.holds(key) {
            Ok(())
        } else {
            Err(StoreError::Unlocked(key.to_string()))
        }
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// The user's batches active at `as_of`, in consumption order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unlocked` if the user's lock is not held, or a
    /// database error.
    pub fn active_batches(
        &self,
        user_id: UserId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<CreditBatch>> {
        self.require(&LockKey::User(user_id))?;

        let mut merged: HashMap<BatchId, CreditBatch> = self
            .store
            .user_batches(&[user_id])?
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        for staged in self.batches.values().filter(|b| b.user_id == user_id) {
            merged.insert(staged.id, staged.clone());
        }

        let mut active: Vec<_> = merged
            .into_values()
            .filter(|b| b.is_active(as_of))
            .collect();
        active.sort_by(consumption_order);
        Ok(active)
    }

    /// Take `amount` out of one batch.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the batch does not exist.
    /// - `StoreError::Unlocked` if the owner's lock is not held.
    /// - `StoreError::Overdraw` if the batch holds less than `amount`.
    pub fn debit_batch(&mut self, batch_id: BatchId, amount: i64) -> Result<CreditBatch> {
        let mut batch = match self.batches.get(&batch_id) {
            Some(staged) => staged.clone(),
            None => self
                .store
                .get_batch(&batch_id)?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "batch",
                    id: batch_id.to_string(),
                })?,
        };
        self.require(&LockKey::User(batch.user_id))?;

        if amount < 0 || batch.remaining_amount < amount {
            return Err(StoreError::Overdraw {
                batch_id,
                remaining: batch.remaining_amount,
                requested: amount,
            });
        }

        batch.remaining_amount -= amount;
        batch.updated_at = Utc::now();
        self.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    /// Stage a new or replaced batch.
    ///
    /// Inserting a fresh batch needs no lock: nothing reads it before commit.
    pub fn put_batch(&mut self, batch: CreditBatch) {
        self.batches.insert(batch.id, batch);
    }

    // =========================================================================
    // Pending tips and links
    // =========================================================================

    /// Pending tips held for `handle`, including staged changes.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unlocked` if the handle's lock is not held, or a
    /// database error.
    pub fn pending_tips(&self, handle: &str) -> Result<Vec<PendingTip>> {
        self.require(&LockKey::Handle(handle.to_string()))?;

        let mut tips: Vec<_> = self
            .store
            .pending_tips(handle)?
            .into_iter()
            .chain(self.pending_puts.iter().filter(|t| t.handle == handle).cloned())
            .filter(|t| {
                !self
                    .pending_deletes
                    .iter()
                    .any(|(h, id)| h == handle && *id == t.id)
            })
            .collect();
        tips.sort_by_key(|t| t.created_at);
        Ok(tips)
    }

    /// Stage a pending tip.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unlocked` if the handle's lock is not held.
    pub fn put_pending_tip(&mut self, tip: PendingTip) -> Result<()> {
        self.require(&LockKey::Handle(tip.handle.clone()))?;
        self.pending_puts.push(tip);
        Ok(())
    }

    /// Stage the removal of a pending tip.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unlocked` if the handle's lock is not held.
    pub fn remove_pending_tip(&mut self, handle: &str, id: PendingTipId) -> Result<()> {
        self.require(&LockKey::Handle(handle.to_string()))?;
        self.pending_deletes.push((handle.to_string(), id));
        Ok(())
    }

    /// The user `handle` is linked to, including a staged link.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn linked_user(&self, handle: &str) -> Result<Option<UserId>> {
        if let Some(user_id) = self.links.get(handle) {
            return Ok(Some(*user_id));
        }
        self.store.linked_user(handle)
    }

    /// Stage a handle link.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unlocked` if the handle's lock is not held.
    pub fn link_handle(&mut self, handle: &str, user_id: UserId) -> Result<()> {
        self.require(&LockKey::Handle(handle.to_string()))?;
        self.links.insert(handle.to_string(), user_id);
        Ok(())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Apply every staged write atomically and release the locks.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write failed; nothing was written.
    pub fn commit(self) -> Result<()> {
        let writes = WriteSet {
            batches: self.batches.into_values().collect(),
            pending_puts: self.pending_puts,
            pending_deletes: self.pending_deletes,
            links: self.links.into_iter().collect(),
        };
        if writes.is_empty() {
            return Ok(());
        }
        self.store.apply(writes)
    }
}
