//! Tip Transfer and account linking.
//!
//! A tip debits the giver through the Consumption Engine and, in the same
//! transaction, either writes a `tip` batch for a registered recipient or
//! parks the credit as a [`PendingTip`] under the recipient's external
//! handle. Linking the handle later turns every pending tip into a batch.

use chrono::Utc;
use cogbill_core::{BillingError, PendingTip, UserId};
use cogbill_store::{LedgerTx, LockKey};

use super::consume::debit_in;
use super::{
    positive, tip_batch, tip_expires_at, Ledger, LinkReceipt, TipDelivery, TipReceipt,
    TipRecipient,
};

fn normalize_handle(handle: &str) -> Option<String> {
    let trimmed = handle.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Ledger {
    /// Move `amount` credits from `from_user_id` to `recipient`.
    ///
    /// The recipient is credited directly when `recipient.user_id` is set or
    /// the handle is already linked; otherwise the credit is held as a
    /// pending tip for the handle.
    ///
    /// # Errors
    ///
    /// - `BillingError::InvalidAmount` if `amount <= 0`.
    /// - `BillingError::SelfTip` if the recipient resolves to the giver.
    /// - `BillingError::InvalidRecipient` if neither a user nor a handle is given.
    /// - `BillingError::InsufficientCredits` if the giver cannot cover the tip.
    /// - `BillingError::StorageTransaction` if the store kept failing.
    pub async fn tip(
        &self,
        from_user_id: UserId,
        recipient: TipRecipient,
        amount: i64,
    ) -> Result<TipReceipt, BillingError> {
        positive(amount)?;
        let handle = normalize_handle(&recipient.handle);

        let receipt = match (recipient.user_id, handle) {
            (Some(to_user_id), _) => {
                if to_user_id == from_user_id {
                    return Err(BillingError::SelfTip);
                }
                self.with_retry("tip", || self.tip_user_once(from_user_id, to_user_id, amount))
                    .await?
            }
            (None, Some(handle)) => {
                self.with_retry("tip", || self.tip_handle_once(from_user_id, &handle, amount))
                    .await?
            }
            (None, None) => {
                return Err(BillingError::InvalidRecipient(
                    "a user ID or an external handle is required".into(),
                ))
            }
        };

        match &receipt.delivery {
            TipDelivery::Credited { user_id, batch_id } => tracing::info!(
                from_user_id = %from_user_id,
                to_user_id = %user_id,
                batch_id = %batch_id,
                amount,
                "Tip credited"
            ),
            TipDelivery::Pending { pending_id } => tracing::info!(
                from_user_id = %from_user_id,
                pending_id = %pending_id,
                amount,
                "Tip held for unlinked handle"
            ),
        }

        Ok(receipt)
    }

    async fn tip_user_once(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        amount: i64,
    ) -> Result<TipReceipt, BillingError> {
        let mut tx = LedgerTx::begin(
            self.store.as_ref(),
            &[LockKey::User(from_user_id), LockKey::User(to_user_id)],
        )
        .await;

        let now = Utc::now();
        let debit = debit_in(&mut tx, from_user_id, amount, now)?;
        let batch = tip_batch(self, to_user_id, amount, now);
        let batch_id = batch.id;
        tx.put_batch(batch);
        tx.commit()?;

        Ok(TipReceipt {
            debit,
            delivery: TipDelivery::Credited {
                user_id: to_user_id,
                batch_id,
            },
        })
    }

    async fn tip_handle_once(
        &self,
        from_user_id: UserId,
        handle: &str,
        amount: i64,
    ) -> Result<TipReceipt, BillingError> {
        let mut tx = LedgerTx::begin(
            self.store.as_ref(),
            &[LockKey::User(from_user_id), LockKey::Handle(handle.to_string())],
        )
        .await;

        let linked = tx.linked_user(handle)?;
        if linked == Some(from_user_id) {
            return Err(BillingError::SelfTip);
        }

        let now = Utc::now();
        let debit = debit_in(&mut tx, from_user_id, amount, now)?;

        let delivery = if let Some(to_user_id) = linked {
            let batch = tip_batch(self, to_user_id, amount, now);
            let batch_id = batch.id;
            tx.put_batch(batch);
            TipDelivery::Credited {
                user_id: to_user_id,
                batch_id,
            }
        } else {
            let pending = PendingTip::new(handle, from_user_id, amount, tip_expires_at(self, now));
            let pending_id = pending.id;
            tx.put_pending_tip(pending)?;
            TipDelivery::Pending { pending_id }
        };

        tx.commit()?;
        Ok(TipReceipt { debit, delivery })
    }

    /// Link `handle` to `user_id` and materialize its pending tips.
    ///
    /// Idempotent for the same user. Pending tips that expired before the
    /// link are dropped.
    ///
    /// # Errors
    ///
    /// - `BillingError::InvalidRecipient` if the handle is blank.
    /// - `BillingError::HandleAlreadyLinked` if another user owns the handle.
    /// - `BillingError::StorageTransaction` if the store kept failing.
    pub async fn link_account(
        &self,
        handle: &str,
        user_id: UserId,
    ) -> Result<LinkReceipt, BillingError> {
        let handle = normalize_handle(handle)
            .ok_or_else(|| BillingError::InvalidRecipient("handle must not be blank".into()))?;

        let receipt = self
            .with_retry("link_account", || self.link_once(&handle, user_id))
            .await?;

        tracing::info!(
            user_id = %user_id,
            handle = %receipt.handle,
            materialized = receipt.materialized.len(),
            credited = receipt.credited,
            expired = receipt.expired,
            "Linked account"
        );

        Ok(receipt)
    }

    async fn link_once(&self, handle: &str, user_id: UserId) -> Result<LinkReceipt, BillingError> {
        let mut tx = LedgerTx::begin(
            self.store.as_ref(),
            &[LockKey::Handle(handle.to_string()), LockKey::User(user_id)],
        )
        .await;

        let already_linked = match tx.linked_user(handle)? {
            Some(existing) if existing == user_id => true,
            Some(_) => {
                return Err(BillingError::HandleAlreadyLinked {
                    handle: handle.to_string(),
                })
            }
            None => false,
        };
        if !already_linked {
            tx.link_handle(handle, user_id)?;
        }

        let now = Utc::now();
        let mut receipt = LinkReceipt {
            user_id,
            handle: handle.to_string(),
            materialized: Vec::new(),
            credited: 0,
            expired: 0,
            already_linked,
        };

        for pending in tx.pending_tips(handle)? {
            tx.remove_pending_tip(handle, pending.id)?;
            if pending.expires_at <= now {
                receipt.expired += 1;
                continue;
            }
            let batch = pending.materialize(user_id);
            receipt.materialized.push(batch.id);
            receipt.credited += batch.remaining_amount;
            tx.put_batch(batch);
        }

        tx.commit()?;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use cogbill_core::{never_expires, CreditType};

    use super::super::test_support::{memory_ledger, seed};
    use super::super::LedgerOptions;
    use super::*;

    #[tokio::test]
    async fn tip_to_registered_user() {
        let ledger = memory_ledger();
        let a = UserId::generate();
        let b = UserId::generate();
        seed(&ledger, a, &[(30, 1)]);

        let receipt = ledger.tip(a, TipRecipient::user(b), 20).await.unwrap();

        assert_eq!(ledger.balance(a, Utc::now()).unwrap(), 10);
        assert_eq!(ledger.balance(b, Utc::now()).unwrap(), 20);
        assert_eq!(receipt.debit.balance_after, 10);

        let batches = ledger.batches(b).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].credit_type, CreditType::Tip);
        assert_eq!(batches[0].expires_at, never_expires());
        assert!(batches[0].stripe_line_item_id.is_none());
        assert!(matches!(receipt.delivery, TipDelivery::Credited { user_id, .. } if user_id == b));
    }

    #[tokio::test]
    async fn tip_respects_configured_horizon() {
        let ledger = Ledger::new(
            Arc::new(cogbill_store::MemoryStore::new()),
            LedgerOptions {
                tip_expiry: Some(chrono::Duration::days(90)),
                ..LedgerOptions::default()
            },
        );
        let a = UserId::generate();
        let b = UserId::generate();
        seed(&ledger, a, &[(5, 1)]);

        ledger.tip(a, TipRecipient::user(b), 5).await.unwrap();

        let batch = &ledger.batches(b).unwrap()[0];
        assert!(batch.expires_at < Utc::now() + chrono::Duration::days(91));
        assert!(batch.expires_at > Utc::now() + chrono::Duration::days(89));
    }

    #[tokio::test]
    async fn insufficient_tip_writes_nothing() {
        let ledger = memory_ledger();
        let a = UserId::generate();
        let b = UserId::generate();
        seed(&ledger, a, &[(5, 1)]);

        let err = ledger.tip(a, TipRecipient::user(b), 6).await.unwrap_err();

        assert!(matches!(err, BillingError::InsufficientCredits { balance: 5, required: 6 }));
        assert_eq!(ledger.balance(a, Utc::now()).unwrap(), 5);
        assert!(ledger.batches(b).unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_tips_are_rejected() {
        let ledger = memory_ledger();
        let a = UserId::generate();
        seed(&ledger, a, &[(5, 1)]);

        assert_eq!(
            ledger.tip(a, TipRecipient::user(a), 1).await.unwrap_err(),
            BillingError::SelfTip
        );

        ledger.link_account("@alice", a).await.unwrap();
        assert_eq!(
            ledger
                .tip(a, TipRecipient::handle("@alice"), 1)
                .await
                .unwrap_err(),
            BillingError::SelfTip
        );
        assert_eq!(ledger.balance(a, Utc::now()).unwrap(), 5);
    }

    #[tokio::test]
    async fn blank_recipient_is_rejected() {
        let ledger = memory_ledger();
        let err = ledger
            .tip(UserId::generate(), TipRecipient::handle("   "), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidRecipient(_)));
    }

    #[tokio::test]
    async fn tip_to_unknown_handle_is_held_then_materialized() {
        let ledger = memory_ledger();
        let a = UserId::generate();
        seed(&ledger, a, &[(30, 1)]);

        let receipt = ledger
            .tip(a, TipRecipient::handle("@newbie"), 8)
            .await
            .unwrap();
        assert!(matches!(receipt.delivery, TipDelivery::Pending { .. }));
        assert_eq!(ledger.balance(a, Utc::now()).unwrap(), 22);
        assert_eq!(ledger.store().pending_tips("@newbie").unwrap().len(), 1);

        ledger
            .tip(a, TipRecipient::handle("@newbie"), 2)
            .await
            .unwrap();

        let newbie = UserId::generate();
        let link = ledger.link_account("@newbie", newbie).await.unwrap();

        assert_eq!(link.materialized.len(), 2);
        assert_eq!(link.credited, 10);
        assert!(!link.already_linked);
        assert_eq!(ledger.balance(newbie, Utc::now()).unwrap(), 10);
        assert!(ledger.store().pending_tips("@newbie").unwrap().is_empty());

        // Later tips to the handle credit the linked user directly.
        let receipt = ledger
            .tip(a, TipRecipient::handle("@newbie"), 3)
            .await
            .unwrap();
        assert!(matches!(
            receipt.delivery,
            TipDelivery::Credited { user_id, .. } if user_id == newbie
        ));
        assert_eq!(ledger.balance(newbie, Utc::now()).unwrap(), 13);
    }

    #[tokio::test]
    async fn relinking_is_idempotent_and_exclusive() {
        let ledger = memory_ledger();
        let owner = UserId::generate();

        ledger.link_account("@owner", owner).await.unwrap();
        let again = ledger.link_account("@owner", owner).await.unwrap();
        assert!(again.already_linked);
        assert!(again.materialized.is_empty());

        let err = ledger
            .link_account("@owner", UserId::generate())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BillingError::HandleAlreadyLinked {
                handle: "@owner".into()
            }
        );
    }

    #[tokio::test]
    async fn expired_pending_tips_are_dropped_on_link() {
        let ledger = memory_ledger();
        let giver = UserId::generate();
        let stale = PendingTip::new("@late", giver, 4, Utc::now() - chrono::Duration::hours(1));
        ledger
            .store()
            .apply(cogbill_store::WriteSet {
                pending_puts: vec![stale],
                ..cogbill_store::WriteSet::default()
            })
            .unwrap();

        let user = UserId::generate();
        let link = ledger.link_account("@late", user).await.unwrap();

        assert_eq!(link.expired, 1);
        assert_eq!(link.credited, 0);
        assert!(ledger.store().pending_tips("@late").unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn third_party_never_sees_half_a_tip() {
        let ledger = memory_ledger();
        let a = UserId::generate();
        let b = UserId::generate();
        seed(&ledger, a, &[(30, 1)]);

        let done = Arc::new(AtomicBool::new(false));
        let observer = {
            let ledger = ledger.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut observed = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    let totals = ledger.balances(&[a, b], Utc::now()).unwrap();
                    observed.push((totals[&a], totals[&b]));
                    tokio::task::yield_now().await;
                }
                observed
            })
        };

        ledger.tip(a, TipRecipient::user(b), 20).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        done.store(true, Ordering::SeqCst);

        for (balance_a, balance_b) in observer.await.unwrap() {
            assert!(
                (balance_a, balance_b) == (30, 0) || (balance_a, balance_b) == (10, 20),
                "observed intermediate state ({balance_a}, {balance_b})"
            );
        }
        assert_eq!(ledger.balance(a, Utc::now()).unwrap(), 10);
        assert_eq!(ledger.balance(b, Utc::now()).unwrap(), 20);
    }
}
