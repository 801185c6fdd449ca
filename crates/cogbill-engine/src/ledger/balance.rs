//! Balance Calculator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use cogbill_core::{consumption_order, spendable_balance, BillingError, CreditBatch, UserId};

use super::Ledger;

impl Ledger {
    /// Spendable balance of `user_id` at `as_of`.
    ///
    /// Sums `remaining_amount` over the batches with `expires_at > as_of`,
    /// read from one consistent snapshot. Advisory: a debit re-checks inside
    /// its own transaction.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::StorageTransaction` if the store read fails.
    pub fn balance(&self, user_id: UserId, as_of: DateTime<Utc>) -> Result<i64, BillingError> {
        let batches = self.store.user_batches(&[user_id])?;
        Ok(spendable_balance(&batches, as_of))
    }

    /// Balances of several users read from one snapshot.
    ///
    /// Every requested user has an entry, zero if they own nothing. A tip
    /// between two of them is either fully visible or not at all.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::StorageTransaction` if the store read fails.
    pub fn balances(
        &self,
        user_ids: &[UserId],
        as_of: DateTime<Utc>,
    ) -> Result<HashMap<UserId, i64>, BillingError> {
        let mut totals: HashMap<UserId, i64> = user_ids.iter().map(|id| (*id, 0)).collect();
        for batch in self.store.user_batches(user_ids)? {
            if batch.is_active(as_of) {
                *totals.entry(batch.user_id).or_default() += batch.remaining_amount;
            }
        }
        Ok(totals)
    }

    /// Every batch of `user_id`, expired and exhausted ones included, in
    /// consumption order.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::StorageTransaction` if the store read fails.
    pub fn batches(&self, user_id: UserId) -> Result<Vec<CreditBatch>, BillingError> {
        let mut batches = self.store.user_batches(&[user_id])?;
        batches.sort_by(consumption_order);
        Ok(batches)
    }
}
