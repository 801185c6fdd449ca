//! Identifier types for cogbill.
//!
//! This module provides strongly-typed identifiers for users, credit batches,
//! pending tips, and job correlation.
//!
//! # Macro-based ID Types
//!
//! The `uuid_id_type!` macro reduces boilerplate for UUID-based identifier types,
//! ensuring consistent implementation of serialization, parsing, and display traits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Macro to define a UUID-based identifier type with standard trait implementations.
///
/// This macro generates a newtype wrapper around `uuid::Uuid` with implementations for:
/// - `Clone`, `Copy`, `PartialEq`, `Eq`, `PartialOrd`, `Ord`, `Hash`
/// - `Serialize`, `Deserialize` (as string)
/// - `FromStr`, `Display`, `Debug`
/// - `TryFrom<String>`, `Into<String>`
macro_rules! uuid_id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new identifier from a UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            /// Return the bytes of the UUID (16 bytes).
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }
    };
}

uuid_id_type!(UserId, "A registered user identifier (UUID).\n\nUsers are created by the external auth collaborator; this crate only references them.");
uuid_id_type!(BatchId, "A credit batch identifier (UUID).");
uuid_id_type!(PendingTipId, "Identifier of a tip held for a recipient that has not linked an account yet.");

/// A job correlation identifier using ULID for time-ordering.
///
/// Chosen by the dispatcher for every submission attempt and echoed back by
/// the cog worker in each webhook, so it is the key that ties a webhook to
/// the caller waiting on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(Ulid);

impl CorrelationId {
    /// Create a new `CorrelationId` from a ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Generate a new `CorrelationId` with the current timestamp.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Return the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> &Ulid {
        &self.0
    }

    /// Return the bytes of the ULID (16 bytes).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    /// Create a `CorrelationId` from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }
}

impl FromStr for CorrelationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = Ulid::from_string(s).map_err(|_| IdError::InvalidUlid)?;
        Ok(Self(ulid))
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,

    /// The input is not a valid ULID.
    #[error("invalid ULID format")]
    InvalidUlid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parses_its_display_form() {
        let id = UserId::generate();
        let parsed = UserId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn batch_id_serializes_as_plain_string() {
        let id = BatchId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn correlation_ids_are_time_ordered() {
        let first = CorrelationId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = CorrelationId::generate();
        assert!(first < second);
    }

    #[test]
    fn correlation_id_rejects_uuid_text() {
        let err = CorrelationId::from_str(&UserId::generate().to_string()).unwrap_err();
        assert_eq!(err, IdError::InvalidUlid);
    }

    #[test]
    fn correlation_id_bytes_roundtrip() {
        let id = CorrelationId::generate();
        assert_eq!(CorrelationId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn user_id_rejects_garbage() {
        assert_eq!(UserId::from_str("not-a-uuid"), Err(IdError::InvalidUuid));
    }
}
