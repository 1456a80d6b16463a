use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{header, request::Parts, StatusCode},
};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;
use tracing::{debug, error};

use crate::models::{Role, UserId};
use crate::services::cancellation::Requester;
use crate::AppState;

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

impl AuthUser {
    pub fn requester(&self) -> Requester {
        Requester { user_id: self.user_id, is_admin: self.role == Role::Admin }
    }
}

/// Splits an `Authorization: Basic ...` value into email and password.
fn basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (email, password) = credentials.split_once(':')?;
    Some((email.to_string(), password.to_string()))
}

// Basic auth against users.password_hash
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let (email, password) = basic_credentials(header_value).ok_or(StatusCode::UNAUTHORIZED)?;

        let user = state
            .store
            .user_by_email(&email)
            .await
            .map_err(|e| {
                error!("user lookup failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        // bcrypt is deliberately slow, keep it off the async workers
        let (user, valid) = tokio::task::spawn_blocking(move || {
            let valid = user.verify_password(&password);
            (user, valid)
        })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        if !valid {
            debug!(email = %user.email, "invalid credentials");
            return Err(StatusCode::UNAUTHORIZED);
        }

        Ok(AuthUser {
            user_id: user.id,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
        })
    }
}

// No Authorization header means a guest; a bad one is still rejected.
impl OptionalFromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Option<Self>, Self::Rejection> {
        if !parts.headers.contains_key(header::AUTHORIZATION) {
            return Ok(None);
        }
        <AuthUser as FromRequestParts<Arc<AppState>>>::from_request_parts(parts, state)
            .await
            .map(Some)
    }
}
