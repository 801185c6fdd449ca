//! Error types for the credit ledger.

use crate::ids::IdError;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in ledger operations.
///
/// `InsufficientCredits` is an expected business outcome and callers are
/// meant to show it to the user. `StorageTransaction` is an infrastructure
/// failure and the only variant that is safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    /// Insufficient spendable credits for the operation.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Spendable balance at the time of the check.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// Amount is zero, negative, or otherwise unusable.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A batch definition violates a ledger invariant.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A user tried to tip themselves.
    #[error("cannot tip yourself")]
    SelfTip,

    /// A tip names neither a user nor a usable handle.
    #[error("invalid tip recipient: {0}")]
    InvalidRecipient(String),

    /// The external handle is already linked to another user.
    #[error("handle {handle} is already linked to another user")]
    HandleAlreadyLinked {
        /// The external handle.
        handle: String,
    },

    /// The ledger store failed to read or commit.
    #[error("storage transaction failed: {0}")]
    StorageTransaction(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl BillingError {
    /// Whether the whole operation may be attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageTransaction(_))
    }
}
