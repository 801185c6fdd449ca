//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the [`LedgerStore`]
//! trait. Reads that span several keys go through one `RocksDB` snapshot and
//! [`LedgerStore::apply`] commits a single `WriteBatch`.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use cogbill_core::{BatchId, CorrelationId, CreditBatch, Job, PendingTip, UserId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::locks::LockTable;
use crate::schema::{all_column_families, cf};
use crate::{LedgerStore, WriteSet};

type Db = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed ledger store.
pub struct RocksStore {
    db: Arc<Db>,
    locks: LockTable,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, path, cf_descriptors).map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            locks: LockTable::new(),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[allow(clippy::needless_pass_by_value)]
fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl LedgerStore for RocksStore {
    fn locks(&self) -> &LockTable {
        &self.locks
    }

    fn user_batches(&self, user_ids: &[UserId]) -> Result<Vec<CreditBatch>> {
        let cf_batches = self.cf(cf::BATCHES)?;
        let cf_by_user = self.cf(cf::BATCHES_BY_USER)?;
        let snapshot = self.db.snapshot();

        let mut batches = Vec::new();
        for user_id in user_ids {
            let prefix = keys::user_batches_prefix(user_id);
            let iter =
                snapshot.iterator_cf(&cf_by_user, IteratorMode::From(&prefix, Direction::Forward));

            for item in iter {
                let (key, _) = item.map_err(db_err)?;
                if !key.starts_with(&prefix) {
                    break;
                }
                let Some(batch_id) = keys::extract_batch_id_from_user_key(&key) else {
                    continue;
                };
                if let Some(data) = snapshot
                    .get_cf(&cf_batches, keys::batch_key(&batch_id))
                    .map_err(db_err)?
                {
                    batches.push(Self::deserialize(&data)?);
                }
            }
        }

        Ok(batches)
    }

    fn get_batch(&self, batch_id: &BatchId) -> Result<Option<CreditBatch>> {
        let cf = self.cf(cf::BATCHES)?;
        self.db
            .get_cf(&cf, keys::batch_key(batch_id))
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn pending_tips(&self, handle: &str) -> Result<Vec<PendingTip>> {
        let cf = self.cf(cf::PENDING_TIPS)?;
        let prefix = keys::pending_prefix(handle);

        let mut tips: Vec<PendingTip> = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            tips.push(Self::deserialize(&value)?);
        }

        tips.sort_by_key(|t| t.created_at);
        Ok(tips)
    }

    fn linked_user(&self, handle: &str) -> Result<Option<UserId>> {
        let cf = self.cf(cf::HANDLE_LINKS)?;
        self.db
            .get_cf(&cf, keys::link_key(handle))
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn apply(&self, writes: WriteSet) -> Result<()> {
        let cf_batches = self.cf(cf::BATCHES)?;
        let cf_by_user = self.cf(cf::BATCHES_BY_USER)?;
        let cf_pending = self.cf(cf::PENDING_TIPS)?;
        let cf_links = self.cf(cf::HANDLE_LINKS)?;

        let mut batch = WriteBatch::default();

        for credit_batch in &writes.batches {
            let value = Self::serialize(credit_batch)?;
            batch.put_cf(&cf_batches, keys::batch_key(&credit_batch.id), &value);
            batch.put_cf(
                &cf_by_user,
                keys::user_batch_key(&credit_batch.user_id, &credit_batch.id),
                [],
            );
        }
        for tip in &writes.pending_puts {
            let value = Self::serialize(tip)?;
            batch.put_cf(&cf_pending, keys::pending_key(&tip.handle, &tip.id), &value);
        }
        for (handle, id) in &writes.pending_deletes {
            batch.delete_cf(&cf_pending, keys::pending_key(handle, id));
        }
        for (handle, user_id) in &writes.links {
            let value = Self::serialize(user_id)?;
            batch.put_cf(&cf_links, keys::link_key(handle), &value);
        }

        self.db.write(batch).map_err(db_err)?;

        tracing::trace!(
            batches = writes.batches.len(),
            pending_puts = writes.pending_puts.len(),
            pending_deletes = writes.pending_deletes.len(),
            links = writes.links.len(),
            "applied ledger write set"
        );

        Ok(())
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        let cf = self.cf(cf::JOBS)?;
        let value = Self::serialize(job)?;
        self.db
            .put_cf(&cf, keys::job_key(&job.correlation_id), value)
            .map_err(db_err)
    }

    fn get_job(&self, correlation_id: &CorrelationId) -> Result<Option<Job>> {
        let cf = self.cf(cf::JOBS)?;
        self.db
            .get_cf(&cf, keys::job_key(correlation_id))
            .map_err(db_err)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cogbill_core::{never_expires, CreditType, JobKind, JobStatus};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn batches_roundtrip_through_the_user_index() {
        let (store, _dir) = create_test_store();
        let alice = UserId::generate();
        let bob = UserId::generate();
        let batch = CreditBatch::new(alice, CreditType::Purchase, 25, never_expires());

        store
            .apply(WriteSet {
                batches: vec![
                    batch.clone(),
                    CreditBatch::new(bob, CreditType::Promo, 3, never_expires()),
                ],
                ..WriteSet::default()
            })
            .unwrap();

        assert_eq!(store.user_batches(&[alice]).unwrap(), vec![batch.clone()]);
        assert_eq!(store.user_batches(&[alice, bob]).unwrap().len(), 2);
        assert_eq!(store.get_batch(&batch.id).unwrap(), Some(batch));
    }

    #[test]
    fn overwriting_a_batch_keeps_one_index_entry() {
        let (store, _dir) = create_test_store();
        let user = UserId::generate();
        let mut batch = CreditBatch::new(user, CreditType::Tip, 10, never_expires());

        store
            .apply(WriteSet {
                batches: vec![batch.clone()],
                ..WriteSet::default()
            })
            .unwrap();
        batch.remaining_amount = 4;
        store
            .apply(WriteSet {
                batches: vec![batch.clone()],
                ..WriteSet::default()
            })
            .unwrap();

        let stored = store.user_batches(&[user]).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].remaining_amount, 4);
    }

    #[test]
    fn pending_tips_are_scoped_to_their_handle() {
        let (store, _dir) = create_test_store();
        let tip = PendingTip::new("@erin", UserId::generate(), 5, never_expires());
        let other = PendingTip::new("@erin2", UserId::generate(), 1, never_expires());

        store
            .apply(WriteSet {
                pending_puts: vec![tip.clone(), other],
                ..WriteSet::default()
            })
            .unwrap();
        assert_eq!(store.pending_tips("@erin").unwrap(), vec![tip.clone()]);

        store
            .apply(WriteSet {
                pending_deletes: vec![("@erin".into(), tip.id)],
                ..WriteSet::default()
            })
            .unwrap();
        assert!(store.pending_tips("@erin").unwrap().is_empty());
        assert_eq!(store.pending_tips("@erin2").unwrap().len(), 1);
    }

    #[test]
    fn links_persist_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let user = UserId::generate();
        {
            let store = RocksStore::open(temp_dir.path()).unwrap();
            store
                .apply(WriteSet {
                    links: vec![("@frank".into(), user)],
                    ..WriteSet::default()
                })
                .unwrap();
        }

        let store = RocksStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.linked_user("@frank").unwrap(), Some(user));
        assert_eq!(store.linked_user("@nobody").unwrap(), None);
    }

    #[test]
    fn job_records_roundtrip() {
        let (store, _dir) = create_test_store();
        let mut job = Job::new(
            CorrelationId::generate(),
            UserId::generate(),
            JobKind::Voiceover,
            3,
            Vec::new(),
        );
        store.put_job(&job).unwrap();
        job.transition(JobStatus::Completed);
        store.put_job(&job).unwrap();

        let stored = store.get_job(&job.correlation_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }
}
