//! The credit ledger.
//!
//! [`Ledger`] is the only writer of credit batches. Every mutation runs in a
//! [`cogbill_store::LedgerTx`] holding the locks of the users and handles it
//! touches, and a whole attempt is retried when the store reports a
//! transient failure.

mod balance;
mod consume;
mod refund;
mod tip;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cogbill_core::{BatchDebit, BatchId, BillingError, CreditBatch, CreditType, Period, UserId};
use cogbill_store::LedgerStore;
use serde::{Deserialize, Serialize};

/// Default number of attempts for a ledger operation.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between attempts (doubles with each attempt).
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;

/// Maximum backoff between attempts.
const DEFAULT_MAX_BACKOFF_MS: u64 = 2000;

/// Ledger tuning.
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Attempts per operation when the store fails transiently.
    pub max_attempts: u32,

    /// Backoff before the second attempt.
    pub initial_backoff: Duration,

    /// Upper bound for the backoff.
    pub max_backoff: Duration,

    /// Lifetime of tip batches. `None` means tips never expire.
    pub tip_expiry: Option<chrono::Duration>,

    /// Shortest lifetime a refund batch is given when every debited batch
    /// has already expired.
    pub refund_min_lifetime: chrono::Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            tip_expiry: None,
            refund_min_lifetime: chrono::Duration::days(1),
        }
    }
}

/// Result of a successful debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitReceipt {
    /// How much each batch paid, in consumption order.
    pub allocations: Vec<BatchDebit>,

    /// Spendable balance right after the debit.
    pub balance_after: i64,
}

impl DebitReceipt {
    /// Total amount debited.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.allocations.iter().map(|a| a.amount).sum()
    }
}

/// Who a tip goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipRecipient {
    /// The recipient's user ID, when they are registered.
    #[serde(default)]
    pub user_id: Option<UserId>,

    /// The recipient's external handle.
    #[serde(default)]
    pub handle: String,
}

impl TipRecipient {
    /// A registered recipient.
    #[must_use]
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            handle: String::new(),
        }
    }

    /// A recipient known only by external handle.
    #[must_use]
    pub fn handle(handle: impl Into<String>) -> Self {
        Self {
            user_id: None,
            handle: handle.into(),
        }
    }
}

/// Where the credited side of a tip went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TipDelivery {
    /// A tip batch was written for a registered user.
    Credited {
        /// The recipient.
        user_id: UserId,
        /// The new tip batch.
        batch_id: BatchId,
    },
    /// The tip is held until the handle is linked.
    Pending {
        /// The pending tip.
        pending_id: cogbill_core::PendingTipId,
    },
}

/// Result of a tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipReceipt {
    /// The giver's side.
    pub debit: DebitReceipt,

    /// The recipient's side.
    pub delivery: TipDelivery,
}

/// Result of linking a handle to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkReceipt {
    /// The linked user.
    pub user_id: UserId,

    /// The linked handle.
    pub handle: String,

    /// Tip batches created from pending tips.
    pub materialized: Vec<BatchId>,

    /// Total credited from pending tips.
    pub credited: i64,

    /// Pending tips dropped because they expired before the link.
    pub expired: usize,

    /// Whether the handle was already linked to this user.
    pub already_linked: bool,
}

/// A request to create a batch from an outside source (billing, promo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    /// Owner of the new batch.
    pub user_id: UserId,

    /// Origin of the credits.
    pub credit_type: CreditType,

    /// Initial amount.
    pub amount: i64,

    /// Start of validity. Defaults to now.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,

    /// End of validity. Defaults to never.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Replenishment cadence for recurring batches.
    #[serde(default)]
    pub period: Option<Period>,

    /// Billing line item the batch was paid by.
    #[serde(default)]
    pub stripe_line_item_id: Option<String>,
}

/// The credit ledger.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    options: LedgerOptions,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Create a ledger over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, options: LedgerOptions) -> Self {
        Self { store, options }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// The ledger options.
    #[must_use]
    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    /// Run `attempt` until it succeeds, fails permanently, or runs out of
    /// attempts, with exponential backoff between tries.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<T, BillingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BillingError>>,
    {
        let max_attempts = self.options.max_attempts.max(1);
        let mut tries = 0;
        let mut backoff = self.options.initial_backoff;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tries += 1;

                    if tries >= max_attempts {
                        tracing::error!(
                            operation,
                            attempt = tries,
                            error = %e,
                            "Ledger operation failed after max retries"
                        );
                        return Err(e);
                    }

                    tracing::debug!(
                        operation,
                        attempt = tries,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Ledger operation failed, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn positive(amount: i64) -> Result<(), BillingError> {
    if amount <= 0 {
        return Err(BillingError::InvalidAmount(format!(
            "amount must be positive (got {amount})"
        )));
    }
    Ok(())
}

fn tip_expires_at(ledger: &Ledger, now: DateTime<Utc>) -> DateTime<Utc> {
    ledger
        .options
        .tip_expiry
        .map_or_else(cogbill_core::never_expires, |lifetime| now + lifetime)
}

fn tip_batch(ledger: &Ledger, user_id: UserId, amount: i64, now: DateTime<Utc>) -> CreditBatch {
    CreditBatch::new(user_id, CreditType::Tip, amount, tip_expires_at(ledger, now))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use cogbill_core::{BatchId, CorrelationId, CreditBatch, CreditType, Job, PendingTip, UserId};
    use cogbill_store::{LedgerStore, LockTable, MemoryStore, StoreError, WriteSet};

    use super::{Ledger, LedgerOptions};

    /// A memory store whose first `failures` commits fail.
    pub struct FlakyStore {
        pub inner: MemoryStore,
        pub failures: AtomicU32,
        pub applies: AtomicU32,
    }

    impl FlakyStore {
        pub fn failing(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                applies: AtomicU32::new(0),
            }
        }
    }

    impl LedgerStore for FlakyStore {
        fn locks(&self) -> &LockTable {
            self.inner.locks()
        }
        fn user_batches(&self, user_ids: &[UserId]) -> cogbill_store::Result<Vec<CreditBatch>> {
            self.inner.user_batches(user_ids)
        }
        fn get_batch(&self, batch_id: &BatchId) -> cogbill_store::Result<Option<CreditBatch>> {
            self.inner.get_batch(batch_id)
        }
        fn pending_tips(&self, handle: &str) -> cogbill_store::Result<Vec<PendingTip>> {
            self.inner.pending_tips(handle)
        }
        fn linked_user(&self, handle: &str) -> cogbill_store::Result<Option<UserId>> {
            self.inner.linked_user(handle)
        }
        fn apply(&self, writes: WriteSet) -> cogbill_store::Result<()> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Database("injected failure".into()));
            }
            self.inner.apply(writes)
        }
        fn put_job(&self, job: &Job) -> cogbill_store::Result<()> {
            self.inner.put_job(job)
        }
        fn get_job(&self, id: &CorrelationId) -> cogbill_store::Result<Option<Job>> {
            self.inner.get_job(id)
        }
    }

    pub fn memory_ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), fast_options())
    }

    pub fn fast_options() -> LedgerOptions {
        LedgerOptions {
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(4),
            ..LedgerOptions::default()
        }
    }

    /// Seed `user_id` with purchase batches of `(amount, expires_in_days)`.
    pub fn seed(ledger: &Ledger, user_id: UserId, batches: &[(i64, i64)]) -> Vec<BatchId> {
        let batches: Vec<_> = batches
            .iter()
            .map(|(amount, days)| {
                CreditBatch::new(
                    user_id,
                    CreditType::Purchase,
                    *amount,
                    Utc::now() + Duration::days(*days),
                )
            })
            .collect();
        let ids = batches.iter().map(|b| b.id).collect();
        ledger
            .store()
            .apply(WriteSet {
                batches,
                ..WriteSet::default()
            })
            .unwrap();
        ids
    }
}
