//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Credit batches, keyed by `batch_id`.
    pub const BATCHES: &str = "batches";

    /// Index: batches by owner, keyed by `user_id || batch_id`.
    /// Value is empty (index only).
    pub const BATCHES_BY_USER: &str = "batches_by_user";

    /// Pending tips, keyed by `handle || 0xFF || pending_tip_id`.
    pub const PENDING_TIPS: &str = "pending_tips";

    /// Handle links, keyed by handle, value is the `user_id` bytes.
    pub const HANDLE_LINKS: &str = "handle_links";

    /// Job records, keyed by `correlation_id` (ULID).
    pub const JOBS: &str = "jobs";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BATCHES,
        cf::BATCHES_BY_USER,
        cf::PENDING_TIPS,
        cf::HANDLE_LINKS,
        cf::JOBS,
    ]
}
