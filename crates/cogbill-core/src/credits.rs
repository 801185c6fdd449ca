//! Credit batch types for cogbill.
//!
//! A user's spendable balance is not a single counter: it is the sum of the
//! remaining amounts of every unexpired [`CreditBatch`] they own. Batches come
//! from subscriptions, purchases, promos, tips, and refunds, and each carries
//! its own expiry.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BatchId, PendingTipId, UserId};

// ============================================================================
// Constants
// ============================================================================

/// Unix timestamp of the "never expires" sentinel (9999-12-31T23:59:59Z).
pub const NEVER_EXPIRES_UNIX: i64 = 253_402_300_799;

/// The far-future expiry used for batches that never expire.
#[must_use]
pub fn never_expires() -> DateTime<Utc> {
    DateTime::from_timestamp(NEVER_EXPIRES_UNIX, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Origin of a credit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    /// Granted by a subscription tier.
    Subscription,
    /// One-off purchase.
    Purchase,
    /// Received from another user.
    Tip,
    /// Promotional grant.
    Promo,
    /// Compensating credit for a job that did not deliver.
    Refund,
}

impl CreditType {
    /// Get the credit type name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Purchase => "purchase",
            Self::Tip => "tip",
            Self::Promo => "promo",
            Self::Refund => "refund",
        }
    }
}

/// Replenishment cadence of a recurring batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "unit", content = "count")]
pub enum Period {
    /// Every N days.
    Days(u32),
    /// Every N calendar months.
    Months(u32),
}

/// One priced, time-bounded allotment of spendable credit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBatch {
    /// Unique batch ID.
    pub id: BatchId,

    /// Owner of the batch.
    pub user_id: UserId,

    /// Where the credit came from.
    pub credit_type: CreditType,

    /// Credits left in this batch. Never negative.
    pub remaining_amount: i64,

    /// When the batch becomes valid.
    pub starts_at: DateTime<Utc>,

    /// When the batch is forfeited. Always after `starts_at`.
    pub expires_at: DateTime<Utc>,

    /// Replenishment cadence, `None` for one-off batches.
    pub period: Option<Period>,

    /// Last time a recurring batch was topped up.
    pub replenished_at: Option<DateTime<Utc>>,

    /// External billing line item, `None` for tips, promos, and refunds.
    pub stripe_line_item_id: Option<String>,

    /// When the batch was created.
    pub created_at: DateTime<Utc>,

    /// When the batch was last changed.
    pub updated_at: DateTime<Utc>,
}

impl CreditBatch {
    /// Create a one-off batch starting now.
    #[must_use]
    pub fn new(
        user_id: UserId,
        credit_type: CreditType,
        amount: i64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BatchId::generate(),
            user_id,
            credit_type,
            remaining_amount: amount,
            starts_at: now,
            expires_at,
            period: None,
            replenished_at: None,
            stripe_line_item_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the batch still counts toward the balance at `as_of`.
    #[must_use]
    pub fn is_active(&self, as_of: DateTime<Utc>) -> bool {
        self.expires_at > as_of
    }

    /// Check the batch invariants.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.remaining_amount < 0 {
            return Err(format!(
                "remaining amount must not be negative (got {})",
                self.remaining_amount
            ));
        }
        if self.expires_at <= self.starts_at {
            return Err("expires_at must be after starts_at".into());
        }
        Ok(())
    }
}

/// Soonest-expiring-first consumption order.
///
/// Batches closest to forfeiture are spent before those with more runway;
/// ties fall back to creation time and then to the batch ID so the order is
/// total.
#[must_use]
pub fn consumption_order(a: &CreditBatch, b: &CreditBatch) -> Ordering {
    a.expires_at
        .cmp(&b.expires_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sum the remaining amounts of the batches active at `as_of`.
#[must_use]
pub fn spendable_balance<'a>(
    batches: impl IntoIterator<Item = &'a CreditBatch>,
    as_of: DateTime<Utc>,
) -> i64 {
    batches
        .into_iter()
        .filter(|b| b.is_active(as_of))
        .map(|b| b.remaining_amount)
        .sum()
}

/// Amount taken from one batch by a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDebit {
    /// The batch that paid.
    pub batch_id: BatchId,
    /// How much it paid.
    pub amount: i64,
    /// The batch expiry at the time of the debit.
    pub expires_at: DateTime<Utc>,
}

/// Plan the allocation of `amount` across `batches`.
///
/// `batches` must already be in [`consumption_order`] and filtered to active
/// ones. Returns `None` when the batches cannot cover the amount.
#[must_use]
pub fn plan_debit(batches: &[CreditBatch], amount: i64) -> Option<Vec<BatchDebit>> {
    let mut outstanding = amount;
    let mut allocations = Vec::new();

    for batch in batches {
        if outstanding == 0 {
            break;
        }
        if batch.remaining_amount <= 0 {
            continue;
        }
        let take = batch.remaining_amount.min(outstanding);
        allocations.push(BatchDebit {
            batch_id: batch.id,
            amount: take,
            expires_at: batch.expires_at,
        });
        outstanding -= take;
    }

    (outstanding == 0).then_some(allocations)
}

/// A tip held for an external handle that has no linked account yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTip {
    /// Unique pending tip ID.
    pub id: PendingTipId,

    /// External handle of the intended recipient.
    pub handle: String,

    /// The user who gave the tip.
    pub from_user_id: UserId,

    /// Amount held.
    pub amount: i64,

    /// Expiry the materialized batch will carry.
    pub expires_at: DateTime<Utc>,

    /// When the tip was given.
    pub created_at: DateTime<Utc>,
}

impl PendingTip {
    /// Create a new pending tip.
    #[must_use]
    pub fn new(
        handle: impl Into<String>,
        from_user_id: UserId,
        amount: i64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PendingTipId::generate(),
            handle: handle.into(),
            from_user_id,
            amount,
            expires_at,
            created_at: Utc::now(),
        }
    }

    /// Turn the held credit into a real batch owned by `user_id`.
    #[must_use]
    pub fn materialize(&self, user_id: UserId) -> CreditBatch {
        CreditBatch::new(user_id, CreditType::Tip, self.amount, self.expires_at)
    }
}
