//! Ledger storage layer for cogbill.
//!
//! This crate is the persistence collaborator of the credit ledger. It keeps
//! credit batches, pending tips, handle links, and job records, and exposes
//! a transaction boundary ([`LedgerTx`]) that the ledger engine controls.
//!
//! # Architecture
//!
//! - [`LedgerStore`] is the backend trait: consistent snapshot reads plus a
//!   single atomic [`LedgerStore::apply`] of a [`WriteSet`].
//! - [`LedgerTx`] takes per-key locks from the store's [`LockTable`], reads
//!   through its own staged writes, and commits them in one `apply`.
//!   Dropping a transaction without committing discards every staged write.
//! - [`MemoryStore`] keeps everything in process (tests, single-node dev).
//! - `RocksStore` (feature `rocksdb-backend`) persists to `RocksDB` column
//!   families and commits with a `WriteBatch`.
//!
//! # Example
//!
//! ```no_run
//! use cogbill_core::{never_expires, CreditBatch, CreditType, UserId};
//! use cogbill_store::{LedgerTx, LockKey, MemoryStore};
//!
//! # async fn example() -> cogbill_store::Result<()> {
//! let store = MemoryStore::new();
//! let user_id = UserId::generate();
//!
//! let mut tx = LedgerTx::begin(&store, &[LockKey::User(user_id)]).await;
//! tx.put_batch(CreditBatch::new(user_id, CreditType::Promo, 50, never_expires()));
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod locks;
pub mod memory;
pub mod tx;

#[cfg(feature = "rocksdb-backend")]
pub mod keys;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use locks::{KeyGuard, LockGuards, LockKey, LockTable};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;
pub use tx::LedgerTx;

use cogbill_core::{BatchId, CorrelationId, CreditBatch, Job, PendingTip, PendingTipId, UserId};

/// Writes staged by a transaction, applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    /// Batches to insert or overwrite.
    pub batches: Vec<CreditBatch>,

    /// Pending tips to insert.
    pub pending_puts: Vec<PendingTip>,

    /// Pending tips to delete, by handle and ID.
    pub pending_deletes: Vec<(String, PendingTipId)>,

    /// Handle links to record.
    pub links: Vec<(String, UserId)>,
}

impl WriteSet {
    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
            && self.pending_puts.is_empty()
            && self.pending_deletes.is_empty()
            && self.links.is_empty()
    }
}

/// The storage trait defining all ledger operations.
///
/// This trait abstracts the storage layer, allowing for different
/// implementations (`RocksDB`, in-memory for testing).
pub trait LedgerStore: Send + Sync {
    /// Lock table used by [`LedgerTx`] for this store.
    fn locks(&self) -> &LockTable;

    // =========================================================================
    // Batch Operations
    // =========================================================================

    /// All batches owned by any of `user_ids`, read from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn user_batches(&self, user_ids: &[UserId]) -> Result<Vec<CreditBatch>>;

    /// Get a batch by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_batch(&self, batch_id: &BatchId) -> Result<Option<CreditBatch>>;

    // =========================================================================
    // Pending Tip / Link Operations
    // =========================================================================

    /// Pending tips held for `handle`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn pending_tips(&self, handle: &str) -> Result<Vec<PendingTip>>;

    /// The user a handle is linked to, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn linked_user(&self, handle: &str) -> Result<Option<UserId>>;

    // =========================================================================
    // Commit
    // =========================================================================

    /// Apply every write in `writes` atomically.
    ///
    /// Readers observe either none or all of the writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails; nothing is written.
    fn apply(&self, writes: WriteSet) -> Result<()>;

    // =========================================================================
    // Job Records
    // =========================================================================

    /// Insert or update a job record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_job(&self, job: &Job) -> Result<()>;

    /// Get a job by correlation ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_job(&self, correlation_id: &CorrelationId) -> Result<Option<Job>>;
}
