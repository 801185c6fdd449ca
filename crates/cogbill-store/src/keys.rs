//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use cogbill_core::{BatchId, CorrelationId, PendingTipId, UserId};

/// Separator between a handle and a pending tip ID. Never valid UTF-8.
const HANDLE_SEPARATOR: u8 = 0xFF;

/// Create a batch key from a batch ID.
#[must_use]
pub fn batch_key(batch_id: &BatchId) -> Vec<u8> {
    batch_id.as_bytes().to_vec()
}

/// Create a user-batch index key.
///
/// Format: `user_id (16 bytes) || batch_id (16 bytes)`
#[must_use]
pub fn user_batch_key(user_id: &UserId, batch_id: &BatchId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(batch_id.as_bytes());
    key
}

/// Create a prefix for iterating all batches of a user.
#[must_use]
pub fn user_batches_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the batch ID from a user-batch index key.
///
/// Returns `None` if the key is shorter than 32 bytes.
#[must_use]
pub fn extract_batch_id_from_user_key(key: &[u8]) -> Option<BatchId> {
    let bytes: [u8; 16] = key.get(16..32)?.try_into().ok()?;
    Some(BatchId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

/// Create a prefix for iterating the pending tips of a handle.
#[must_use]
pub fn pending_prefix(handle: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(handle.len() + 1);
    key.extend_from_slice(handle.as_bytes());
    key.push(HANDLE_SEPARATOR);
    key
}

/// Create a pending tip key.
///
/// Format: `handle || 0xFF || pending_tip_id (16 bytes)`
#[must_use]
pub fn pending_key(handle: &str, id: &PendingTipId) -> Vec<u8> {
    let mut key = pending_prefix(handle);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Create a handle link key.
#[must_use]
pub fn link_key(handle: &str) -> Vec<u8> {
    handle.as_bytes().to_vec()
}

/// Create a job key from a correlation ID.
#[must_use]
pub fn job_key(correlation_id: &CorrelationId) -> Vec<u8> {
    correlation_id.to_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_batch_key_format() {
        let user_id = UserId::generate();
        let batch_id = BatchId::generate();
        let key = user_batch_key(&user_id, &batch_id);

        assert_eq!(key.len(), 32);
        assert_eq!(&key[..16], user_id.as_bytes());
        assert_eq!(extract_batch_id_from_user_key(&key), Some(batch_id));
    }

    #[test]
    fn short_index_key_is_rejected() {
        assert!(extract_batch_id_from_user_key(&[0u8; 20]).is_none());
    }

    #[test]
    fn pending_keys_share_the_handle_prefix() {
        let id = PendingTipId::generate();
        let key = pending_key("@erin", &id);
        assert!(key.starts_with(&pending_prefix("@erin")));
        assert!(!key.starts_with(&pending_prefix("@eri")));
    }

    #[test]
    fn job_key_length() {
        assert_eq!(job_key(&CorrelationId::generate()).len(), 16);
    }
}
