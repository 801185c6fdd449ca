//! Error types for cogbill storage.

use cogbill_core::{BatchId, BillingError};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Record identifier.
        id: String,
    },

    /// A debit asked for more than the batch holds.
    #[error("batch {batch_id} overdrawn: remaining={remaining}, requested={requested}")]
    Overdraw {
        /// The batch.
        batch_id: BatchId,
        /// Amount left in the batch.
        remaining: i64,
        /// Amount requested.
        requested: i64,
    },

    /// A read-modify-write touched a key the transaction does not hold.
    #[error("transaction does not hold the lock for {0}")]
    Unlocked(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        Self::StorageTransaction(err.to_string())
    }
}
