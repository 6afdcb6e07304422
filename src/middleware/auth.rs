// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Host session authentication.
//!
//! The host application issues an HS256 JWT naming the local user, carried
//! in the `fitlink_session` cookie or a bearer token.

use crate::AppState;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

/// Session cookie set by the host application.
pub const SESSION_COOKIE: &str = "fitlink_session";

fn default_active() -> bool {
    true
}

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (local user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
    /// False for accounts the host has deactivated
    #[serde(default = "default_active")]
    pub active: bool,
}

/// Authenticated local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: u64,
    pub active: bool,
}

/// Decode the session from cookie or `Authorization` header.
pub fn authenticate(headers: &HeaderMap, signing_key: &[u8]) -> Option<AuthUser> {
    let jar = CookieJar::from_headers(headers);
    let token = match jar.get(SESSION_COOKIE) {
        Some(cookie) => cookie.value().to_string(),
        None => headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))?
            .to_string(),
    };

    let key = DecodingKey::from_secret(signing_key);
    let validation = Validation::new(Algorithm::HS256);
    let claims = decode::<Claims>(&token, &key, &validation).ok()?.claims;

    Some(AuthUser {
        user_id: claims.sub.parse().ok()?,
        active: claims.active,
    })
}

/// Middleware for views that need a logged-in user.
///
/// Anonymous requests are redirected to the host login page with `next`
/// pointing back at the requested URL.
pub async fn require_login(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(request.headers(), &state.config.jwt_signing_key) {
        Some(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => {
            let target = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let separator = if state.config.login_url.contains('?') { '&' } else { '?' };
            let location = format!(
                "{}{}next={}",
                state.config.login_url,
                separator,
                urlencoding::encode(target)
            );
            Redirect::temporary(&location).into_response()
        }
    }
}

/// The session user if there is one; never rejects.
#[derive(Debug, Clone, Copy)]
pub struct MaybeUser(pub Option<AuthUser>);

impl FromRequestParts<Arc<AppState>> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeUser(authenticate(
            &parts.headers,
            &state.config.jwt_signing_key,
        )))
    }
}

/// Create a JWT for a user session.
pub fn create_jwt(user_id: u64, active: bool, signing_key: &[u8]) -> anyhow::Result<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        iat: now,
        exp: now + 30 * 24 * 60 * 60, // 30 days
        active,
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key),
    )?)
}
