// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit OAuth linking views: status, login, complete, error, logout.
//!
//! All of these require a logged-in local user.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Redirect,
    routing::get,
    Extension, Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::middleware::AuthUser;
use crate::models::{AccountLink, Category};
use crate::services::tasks::{Job, SubscribePayload, TimeSeriesPayload, UnsubscribePayload};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// How long a login `state` stays valid.
const STATE_MAX_AGE_SECS: u64 = 10 * 60;

/// Delay before removing subscriptions of a disconnected account.
const UNSUBSCRIBE_COUNTDOWN: Duration = Duration::from_secs(5);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/fitbit", get(index))
        .route("/fitbit/login", get(login))
        .route("/fitbit/complete", get(complete))
        .route("/fitbit/error", get(error))
        .route("/fitbit/logout", get(logout))
}

#[derive(Debug, Deserialize)]
pub struct NextParams {
    #[serde(default)]
    next: Option<String>,
}

impl NextParams {
    fn next(&self) -> Option<&str> {
        self.next.as_deref().filter(|n| is_local_path(n))
    }
}

/// Only redirect within this site: a path, not `//host` or `/\\host`.
fn is_local_path(next: &str) -> bool {
    next.starts_with('/') && !next.starts_with("//") && !next.starts_with("/\\")
}

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub integrated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitbit_user: Option<String>,
    pub login_url: String,
    pub logout_url: String,
}

/// Integration status for the current user.
async fn index(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<NextParams>,
) -> Result<Json<IndexResponse>> {
    let link = state.store.get_link(user.user_id).await?;
    let suffix = params
        .next()
        .map(|n| format!("?next={}", urlencoding::encode(n)))
        .unwrap_or_default();

    Ok(Json(IndexResponse {
        integrated: link.is_some(),
        fitbit_user: link.map(|l| l.fitbit_user),
        login_url: format!("/fitbit/login{}", suffix),
        logout_url: format!("/fitbit/logout{}", suffix),
    }))
}

/// Start linking: redirect to Fitbit's authorization page.
async fn login(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<NextParams>,
    headers: HeaderMap,
) -> Result<Redirect> {
    let now = Utc::now().timestamp() as u64;
    let oauth_state = sign_state(
        user.user_id,
        params.next().unwrap_or(""),
        now,
        &state.config.oauth_state_key,
    )?;

    let callback_url = callback_url(&state, &headers);
    let auth_url = state.fitbit.authorize_url(&callback_url, &oauth_state);

    tracing::info!(
        user_id = user.user_id,
        callback = %callback_url,
        "Starting OAuth flow, redirecting to Fitbit"
    );

    Ok(Redirect::temporary(&auth_url))
}

#[derive(Debug, Deserialize)]
pub struct CompleteParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

/// OAuth callback: exchange the code, store the link, schedule initial work.
///
/// Any failure redirects to the configured error page.
async fn complete(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<CompleteParams>,
    headers: HeaderMap,
) -> Redirect {
    match link_account(&state, user, params, &headers).await {
        Ok(next) => Redirect::temporary(&next),
        Err(e) => {
            tracing::warn!(user_id = user.user_id, error = %e, "Fitbit linking failed");
            Redirect::temporary(&state.config.error_redirect)
        }
    }
}

async fn link_account(
    state: &AppState,
    user: AuthUser,
    params: CompleteParams,
    headers: &HeaderMap,
) -> Result<String> {
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing code".to_string()))?;

    let now = Utc::now();
    let next = params
        .state
        .as_deref()
        .and_then(|s| {
            verify_state(
                s,
                user.user_id,
                now.timestamp() as u64,
                &state.config.oauth_state_key,
            )
        })
        .ok_or_else(|| AppError::BadRequest("invalid state".to_string()))?;

    // Check before the exchange so a misconfiguration does not burn a code.
    let subscriber_id = if state.config.subscribe {
        Some(state.config.subscriber_id.clone().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("FITBIT_SUBSCRIBER_ID is not set"))
        })?)
    } else {
        None
    };

    let grant = state
        .fitbit
        .exchange_code(&code, &callback_url(state, headers))
        .await?;

    let link = AccountLink::new(user.user_id, grant.user_id, grant.token, now);
    state.store.link_account(&link).await?;

    tracing::info!(
        user_id = user.user_id,
        fitbit_user = %link.fitbit_user,
        "Fitbit account linked"
    );

    if let Some(subscriber_id) = subscriber_id {
        schedule_initial_jobs(state, &link.fitbit_user, subscriber_id).await;
    }

    Ok(next.unwrap_or_else(|| state.config.login_redirect.clone()))
}

/// Subscribe to notifications, then backfill every subscribed resource.
async fn schedule_initial_jobs(state: &AppState, fitbit_user: &str, subscriber_id: String) {
    let between = state.config.between_delay;

    let subscribe = Job::Subscribe(SubscribePayload {
        fitbit_user: fitbit_user.to_string(),
        subscriber_id,
    });
    if let Err(e) = state.queue.enqueue(subscribe, between).await {
        tracing::warn!(fitbit_user, error = %e, "Failed to queue subscribe task");
    }

    let resources = Category::ALL
        .into_iter()
        .flat_map(|category| state.config.resources_for(category));

    for (i, resource_type) in resources.enumerate() {
        let job = Job::TimeSeries(TimeSeriesPayload {
            fitbit_user: fitbit_user.to_string(),
            category: resource_type.category,
            resource: resource_type.resource.to_string(),
            date: None,
            retries: 0,
        });
        let countdown = state.config.historical_init_delay + between * i as u32;
        if let Err(e) = state.queue.enqueue(job, countdown).await {
            tracing::warn!(
                fitbit_user,
                resource = %resource_type,
                error = %e,
                "Failed to queue historical fetch"
            );
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorPage {
    pub error: &'static str,
    pub message: &'static str,
    pub retry_url: &'static str,
}

/// Landing page after a failed link attempt.
async fn error() -> Json<ErrorPage> {
    Json(ErrorPage {
        error: "fitbit_link_failed",
        message: "We were unable to link your Fitbit account. Please try again.",
        retry_url: "/fitbit/login",
    })
}

/// Unlink the user's Fitbit account and drop its subscriptions.
async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<NextParams>,
) -> Result<Redirect> {
    if let Some(link) = state.store.delete_link(user.user_id).await? {
        let job = Job::Unsubscribe(UnsubscribePayload {
            fitbit_user: link.fitbit_user.clone(),
            access_token: link.access_token,
            refresh_token: link.refresh_token,
            expires_at: link.expires_at,
        });
        if let Err(e) = state.queue.enqueue(job, UNSUBSCRIBE_COUNTDOWN).await {
            tracing::warn!(fitbit_user = %link.fitbit_user, error = %e, "Failed to queue unsubscribe");
        }
        tracing::info!(user_id = user.user_id, fitbit_user = %link.fitbit_user, "Fitbit account unlinked");
    }

    let next = params
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| state.config.logout_redirect.clone());
    Ok(Redirect::temporary(&next))
}

/// Absolute URL of the `complete` view.
fn callback_url(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(base) = &state.config.public_url {
        return format!("{}/fitbit/complete", base);
    }

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:8080");

    let scheme = if host.contains("localhost") || host.contains("127.0.0.1") {
        "http"
    } else {
        "https"
    };

    format!("{}://{}/fitbit/complete", scheme, host)
}

fn mac_for(payload: &str, secret: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Build the signed OAuth `state`: `user_id|next|timestamp_hex|signature_hex`,
/// base64url encoded.
fn sign_state(user_id: u64, next: &str, timestamp: u64, secret: &[u8]) -> Result<String> {
    let payload = format!("{}|{}|{:x}", user_id, urlencoding::encode(next), timestamp);
    let signature = mac_for(&payload, secret)?.finalize().into_bytes();
    let signed = format!("{}|{}", payload, hex::encode(signature));
    Ok(URL_SAFE_NO_PAD.encode(signed.as_bytes()))
}

/// Check a `state` and return the `next` URL it carries (`None` when empty).
///
/// Rejects tampered, expired, or other users' states.
fn verify_state(state: &str, user_id: u64, now: u64, secret: &[u8]) -> Option<Option<String>> {
    let bytes = URL_SAFE_NO_PAD.decode(state).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;

    let mut parts = decoded.splitn(4, '|');
    let (uid, next, timestamp_hex, signature_hex) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);

    let payload = format!("{}|{}|{}", uid, next, timestamp_hex);
    let signature = hex::decode(signature_hex).ok()?;
    if mac_for(&payload, secret).ok()?.verify_slice(&signature).is_err() {
        tracing::error!("OAuth state signature mismatch! Potential tampering.");
        return None;
    }

    if uid.parse::<u64>().ok()? != user_id {
        tracing::warn!(user_id, "OAuth state issued to a different user");
        return None;
    }

    let issued = u64::from_str_radix(timestamp_hex, 16).ok()?;
    if now.saturating_sub(issued) > STATE_MAX_AGE_SECS {
        tracing::warn!(user_id, "OAuth state expired");
        return None;
    }

    let next = urlencoding::decode(next).ok()?.into_owned();
    Some(is_local_path(&next).then_some(next))
}
