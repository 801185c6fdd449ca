//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `ServiceAuth` - upstream callers (chat bot, web frontend) via `x-api-key`
//! - `AdminAuth` - operators granting credits via `x-admin-key`

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_key(provided: Option<&str>, expected: Option<&String>) -> Result<(), ApiError> {
    let provided = provided.ok_or(ApiError::Unauthorized)?;
    let expected = expected.ok_or(ApiError::Unauthorized)?;

    if constant_time_eq(provided, expected) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Service authentication via API key.
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The service name or identifier.
    pub service_name: String,
}

impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            check_key(
                header(parts, "x-api-key"),
                state.config.service_api_key.as_ref(),
            )?;

            let service_name = header(parts, "x-service-name")
                .unwrap_or("unknown")
                .to_string();

            Ok(ServiceAuth { service_name })
        })
    }
}

/// Admin authentication via admin API key.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Who is acting, for the audit log.
    pub admin_id: String,
}

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            if state.config.admin_api_key.is_none() {
                return Err(ApiError::Forbidden);
            }
            check_key(
                header(parts, "x-admin-key"),
                state.config.admin_api_key.as_ref(),
            )?;

            let admin_id = header(parts, "x-admin-id").unwrap_or("admin").to_string();

            Ok(AdminAuth { admin_id })
        })
    }
}
