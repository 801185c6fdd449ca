//! Consumption Engine.

use chrono::{DateTime, Utc};
use cogbill_core::{plan_debit, spendable_balance, BillingError, UserId};
use cogbill_store::{LedgerTx, LockKey};

use super::{positive, DebitReceipt, Ledger};

impl Ledger {
    /// Debit `amount` from `user_id`, soonest-expiring batches first.
    ///
    /// Runs in a transaction holding the user's lock, so concurrent debits
    /// of the same user serialize and can never both spend the same credit.
    /// Either every batch decrement is committed or none is.
    ///
    /// # Errors
    ///
    /// - `BillingError::InvalidAmount` if `amount <= 0`.
    /// - `BillingError::InsufficientCredits` if the active batches cannot
    ///   cover `amount`; nothing is written.
    /// - `BillingError::StorageTransaction` if the store kept failing after
    ///   all retries.
    pub async fn debit(&self, user_id: UserId, amount: i64) -> Result<DebitReceipt, BillingError> {
        positive(amount)?;

        let receipt = self
            .with_retry("debit", || self.debit_once(user_id, amount))
            .await?;

        tracing::info!(
            user_id = %user_id,
            amount,
            batches = receipt.allocations.len(),
            balance_after = receipt.balance_after,
            "Debited credits"
        );

        Ok(receipt)
    }

    async fn debit_once(&self, user_id: UserId, amount: i64) -> Result<DebitReceipt, BillingError> {
        let mut tx = LedgerTx::begin(self.store.as_ref(), &[LockKey::User(user_id)]).await;
        let receipt = debit_in(&mut tx, user_id, amount, Utc::now())?;
        tx.commit()?;
        Ok(receipt)
    }
}

/// Stage a debit of `amount` from `user_id` inside `tx`.
///
/// The transaction must hold the user's lock. On `InsufficientCredits`
/// nothing has been staged.
pub(super) fn debit_in(
    tx: &mut LedgerTx<'_>,
    user_id: UserId,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<DebitReceipt, BillingError> {
    let active = tx.active_batches(user_id, now)?;
    let balance = spendable_balance(&active, now);

    let Some(allocations) = plan_debit(&active, amount) else {
        tracing::debug!(user_id = %user_id, balance, required = amount, "Insufficient credits");
        return Err(BillingError::InsufficientCredits {
            balance,
            required: amount,
        });
    };

    for allocation in &allocations {
        tx.debit_batch(allocation.batch_id, allocation.amount)?;
    }

    Ok(DebitReceipt {
        allocations,
        balance_after: balance - amount,
    })
}
