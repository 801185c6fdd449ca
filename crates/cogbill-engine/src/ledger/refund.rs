//! Compensating refunds and grants.

use chrono::Utc;
use cogbill_core::{never_expires, BatchDebit, BillingError, CreditBatch, CreditType, UserId};
use cogbill_store::{LedgerTx, LockKey};

use super::{positive, GrantRequest, Ledger};

impl Ledger {
    /// Give back the credits taken by `allocations` as one `refund` batch.
    ///
    /// The batch expires with the latest-expiring batch that paid, but never
    /// sooner than [`super::LedgerOptions::refund_min_lifetime`] from now.
    ///
    /// # Errors
    ///
    /// - `BillingError::InvalidAmount` if the allocations total zero.
    /// - `BillingError::StorageTransaction` if the store kept failing.
    pub async fn refund(
        &self,
        user_id: UserId,
        allocations: &[BatchDebit],
        reason: &str,
    ) -> Result<CreditBatch, BillingError> {
        let amount: i64 = allocations.iter().map(|a| a.amount).sum();
        positive(amount)?;

        let now = Utc::now();
        let floor = now + self.options.refund_min_lifetime;
        let expires_at = allocations
            .iter()
            .map(|a| a.expires_at)
            .max()
            .map_or_else(never_expires, |latest| latest.max(floor));

        let batch = self
            .with_retry("refund", || {
                self.credit_once(CreditBatch::new(user_id, CreditType::Refund, amount, expires_at))
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            amount,
            batch_id = %batch.id,
            reason,
            "Refunded credits"
        );

        Ok(batch)
    }

    /// Create a batch from an outside source (subscription, purchase, promo).
    ///
    /// # Errors
    ///
    /// - `BillingError::InvalidAmount` if `amount < 0`.
    /// - `BillingError::InvalidBatch` if `expires_at <= starts_at`.
    /// - `BillingError::StorageTransaction` if the store kept failing.
    pub async fn grant(&self, request: GrantRequest) -> Result<CreditBatch, BillingError> {
        if request.amount < 0 {
            return Err(BillingError::InvalidAmount(format!(
                "grant amount must not be negative (got {})",
                request.amount
            )));
        }

        let mut batch = CreditBatch::new(
            request.user_id,
            request.credit_type,
            request.amount,
            request.expires_at.unwrap_or_else(never_expires),
        );
        if let Some(starts_at) = request.starts_at {
            batch.starts_at = starts_at;
        }
        batch.period = request.period;
        batch.stripe_line_item_id = request.stripe_line_item_id;
        batch.validate().map_err(BillingError::InvalidBatch)?;

        let batch = self
            .with_retry("grant", || self.credit_once(batch.clone()))
            .await?;

        tracing::info!(
            user_id = %batch.user_id,
            credit_type = batch.credit_type.as_str(),
            amount = batch.remaining_amount,
            batch_id = %batch.id,
            "Granted credits"
        );

        Ok(batch)
    }

    async fn credit_once(&self, batch: CreditBatch) -> Result<CreditBatch, BillingError> {
        let mut tx = LedgerTx::begin(self.store.as_ref(), &[LockKey::User(batch.user_id)]).await;
        tx.put_batch(batch.clone());
        tx.commit()?;
        Ok(batch)
    }
}
