//! API handlers.

pub mod accounts;
pub mod credits;
pub mod health;
pub mod jobs;
pub mod webhooks;

use std::str::FromStr;

use crate::error::ApiError;

/// Parse an identifier from a path segment into a JSON `400` on failure.
pub(crate) fn parse_id<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid {what}: {raw}")))
}
