// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit Web API client.
//!
//! Handles:
//! - OAuth2 authorization-code exchange and token refresh
//! - Daily time-series retrieval
//! - Push-notification subscription management
//! - Mapping HTTP failures to typed errors (rate limits carry Retry-After)

use crate::models::{OAuthToken, ResourceType, TimeSeriesEntry, TimeSeriesQuery};
use chrono::{TimeDelta, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;

const API_BASE: &str = "https://api.fitbit.com";
const AUTHORIZE_URL: &str = "https://www.fitbit.com/oauth2/authorize";

/// Scopes requested when linking an account.
pub const DEFAULT_SCOPES: &str =
    "activity heartrate location nutrition profile settings sleep social weight";

/// Used when a 429 arrives without a usable Retry-After header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Errors from the Fitbit API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FitbitError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64 },

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("unexpected HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("refresh token rejected (invalid_grant)")]
    InvalidGrant,

    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl FitbitError {
    /// The stored credentials are no longer usable.
    pub fn is_credentials_error(&self) -> bool {
        matches!(
            self,
            FitbitError::Unauthorized(_) | FitbitError::Forbidden(_) | FitbitError::InvalidGrant
        )
    }

    /// Fitbit asked us to slow down (HTTP 409 or 429).
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            FitbitError::Conflict(_) | FitbitError::TooManyRequests { .. }
        )
    }

    fn from_response(status: StatusCode, retry_after: Option<u64>, body: String) -> Self {
        match status {
            StatusCode::BAD_REQUEST => FitbitError::BadRequest(body),
            StatusCode::UNAUTHORIZED => FitbitError::Unauthorized(body),
            StatusCode::FORBIDDEN => FitbitError::Forbidden(body),
            StatusCode::NOT_FOUND => FitbitError::NotFound(body),
            StatusCode::CONFLICT => FitbitError::Conflict(body),
            StatusCode::TOO_MANY_REQUESTS => FitbitError::TooManyRequests {
                retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            },
            s if s.is_server_error() => FitbitError::Server { status: s.as_u16() },
            s => FitbitError::Status {
                status: s.as_u16(),
                body,
            },
        }
    }
}

impl From<reqwest::Error> for FitbitError {
    fn from(e: reqwest::Error) -> Self {
        FitbitError::Transport(e.to_string())
    }
}

/// `{"errors":[{"errorType":"expired_token", ...}]}`
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "errorType")]
    error_type: String,
}

fn has_error_type(body: &str, error_type: &str) -> bool {
    serde_json::from_str::<ErrorBody>(body)
        .unwrap_or_default()
        .errors
        .iter()
        .any(|e| e.error_type == error_type)
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user_id: String,
}

/// Result of a code exchange or refresh.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: OAuthToken,
    /// Fitbit encoded user ID the token belongs to
    pub user_id: String,
}

/// One registered push subscription.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub owner_id: String,
    pub subscriber_id: String,
    pub subscription_id: String,
    #[serde(default)]
    pub collection_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionList {
    #[serde(default)]
    api_subscriptions: Vec<Subscription>,
}

/// Fitbit API client holding the app's OAuth credentials.
#[derive(Clone)]
pub struct FitbitClient {
    http: reqwest::Client,
    api_base: String,
    authorize_url: String,
    client_id: String,
    client_secret: String,
}

impl FitbitClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
            authorize_url: AUTHORIZE_URL.to_string(),
            client_id,
            client_secret,
        }
    }

    /// Point API and token calls at another host (used by tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        self.api_base = base.to_string();
        self.authorize_url = format!("{}/oauth2/authorize", base);
        self
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/token", self.api_base)
    }

    /// URL to send the user to for granting access.
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.authorize_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(DEFAULT_SCOPES),
            urlencoding::encode(state)
        )
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, FitbitError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.client_id.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    /// Trade a refresh token for a new token pair.
    ///
    /// Fitbit refresh tokens are single-use: after this succeeds the old
    /// refresh token is dead.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, FitbitError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, FitbitError> {
        let response = self
            .http
            .post(self.token_url())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            if has_error_type(&body, "invalid_grant") {
                return Err(FitbitError::InvalidGrant);
            }
            return Err(FitbitError::from_response(status, retry_after, body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FitbitError::Decode(format!("token response: {}", e)))?;

        let expires_at = TimeDelta::try_seconds(token.expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                FitbitError::Decode(format!("token expires_in out of range: {}", token.expires_in))
            })?;

        Ok(TokenGrant {
            token: OAuthToken {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                expires_at,
            },
            user_id: token.user_id,
        })
    }

    /// Start an API session for one linked user.
    pub fn session(&self, fitbit_user: &str, token: OAuthToken) -> FitbitSession {
        FitbitSession {
            client: self.clone(),
            fitbit_user: fitbit_user.to_string(),
            token,
            refreshed: false,
        }
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// API calls on behalf of one user.
///
/// Refreshes the access token when it has expired. After use, callers
/// check [`FitbitSession::refreshed`] and hand the new token to the store.
pub struct FitbitSession {
    client: FitbitClient,
    fitbit_user: String,
    token: OAuthToken,
    refreshed: bool,
}

impl FitbitSession {
    pub fn token(&self) -> &OAuthToken {
        &self.token
    }

    /// True if the token changed during this session.
    pub fn refreshed(&self) -> bool {
        self.refreshed
    }

    /// Daily values of one resource.
    pub async fn time_series(
        &mut self,
        resource_type: &ResourceType,
        query: &TimeSeriesQuery,
    ) -> Result<Vec<TimeSeriesEntry>, FitbitError> {
        let path = format!(
            "/1/user/{}/{}/date/{}.json",
            self.fitbit_user,
            resource_type.path(),
            query.api_segments()
        );
        let mut body: serde_json::Value = self
            .send(Method::GET, &path, None)
            .await?
            .json()
            .await
            .map_err(|e| FitbitError::Decode(e.to_string()))?;

        let key = resource_type.response_key();
        let series = body
            .get_mut(&key)
            .map(serde_json::Value::take)
            .ok_or_else(|| FitbitError::Decode(format!("missing {}", key)))?;

        serde_json::from_value(series).map_err(|e| FitbitError::Decode(e.to_string()))
    }

    /// Register a push subscription for this user.
    pub async fn add_subscription(
        &mut self,
        subscription_id: &str,
        subscriber_id: &str,
    ) -> Result<(), FitbitError> {
        let path = format!("/1/user/-/apiSubscriptions/{}.json", subscription_id);
        self.send(Method::POST, &path, Some(subscriber_id)).await?;
        Ok(())
    }

    pub async fn list_subscriptions(&mut self) -> Result<Vec<Subscription>, FitbitError> {
        let list: SubscriptionList = self
            .send(Method::GET, "/1/user/-/apiSubscriptions.json", None)
            .await?
            .json()
            .await
            .map_err(|e| FitbitError::Decode(e.to_string()))?;
        Ok(list.api_subscriptions)
    }

    pub async fn delete_subscription(
        &mut self,
        subscription_id: &str,
        subscriber_id: &str,
    ) -> Result<(), FitbitError> {
        let path = format!("/1/user/-/apiSubscriptions/{}.json", subscription_id);
        self.send(Method::DELETE, &path, Some(subscriber_id)).await?;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), FitbitError> {
        let grant = self.client.refresh(&self.token.refresh_token).await?;
        tracing::debug!(
            fitbit_user = %self.fitbit_user,
            expires_at = %grant.token.expires_at,
            "Refreshed Fitbit access token"
        );
        self.token = grant.token;
        self.refreshed = true;
        Ok(())
    }

    async fn send(
        &mut self,
        method: Method,
        path: &str,
        subscriber_id: Option<&str>,
    ) -> Result<reqwest::Response, FitbitError> {
        if self.token.is_expired(Utc::now()) {
            self.refresh().await?;
        }

        let mut retried = false;
        loop {
            let mut request = self
                .client
                .http
                .request(method.clone(), format!("{}{}", self.client.api_base, path))
                .bearer_auth(&self.token.access_token);
            if let Some(id) = subscriber_id {
                request = request.header("X-Fitbit-Subscriber-Id", id);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();

            if status == StatusCode::UNAUTHORIZED
                && !retried
                && has_error_type(&body, "expired_token")
            {
                retried = true;
                self.refresh().await?;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                tracing::warn!(
                    fitbit_user = %self.fitbit_user,
                    retry_after,
                    "Fitbit rate limit hit (429)"
                );
            }

            return Err(FitbitError::from_response(status, retry_after, body));
        }
    }
}
