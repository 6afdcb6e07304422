// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::body::Body;
use axum::http::{Request, Response};
use chrono::{Duration, Utc};
use fitlink::config::Config;
use fitlink::db::{MemoryStore, Store};
use fitlink::middleware::auth::{create_jwt, SESSION_COOKIE};
use fitlink::models::{AccountLink, OAuthToken};
use fitlink::routes::create_router;
use fitlink::services::tasks::ScheduledJob;
use fitlink::services::{FitbitClient, GoogleOidcVerifier, LocalQueue, LockCache};
use fitlink::AppState;
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[allow(dead_code)]
pub const USER_ID: u64 = 42;
#[allow(dead_code)]
pub const FITBIT_USER: &str = "228TQ4";

/// Key id of the RSA key test task tokens are signed with.
pub const TASKS_KEY_ID: &str = "test-tasks-key";
const TASKS_PRIVATE_KEY: &[u8] = include_bytes!("tasks_oidc_key.pem");
const TASKS_PUBLIC_KEY: &[u8] = include_bytes!("tasks_oidc_key.pub.pem");

/// App wired to an in-memory store, a local queue and a Fitbit client
/// pointed at `fitbit_url` (usually a wiremock server).
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub jobs: UnboundedReceiver<ScheduledJob>,
}

#[allow(dead_code)]
impl TestApp {
    pub fn new(config: Config, fitbit_url: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (queue, jobs) = LocalQueue::new();
        let fitbit = FitbitClient::new(
            config.fitbit_client_id.clone(),
            config.fitbit_client_secret.clone(),
        )
        .with_base_url(fitbit_url);

        let google_oidc_verifier = GoogleOidcVerifier::with_static_key(
            &config,
            TASKS_KEY_ID,
            DecodingKey::from_rsa_pem(TASKS_PUBLIC_KEY).unwrap(),
        )
        .unwrap();

        let state = Arc::new(AppState {
            config,
            store: store.clone(),
            fitbit,
            queue: Arc::new(queue),
            google_oidc_verifier,
            locks: LockCache::new(),
        });

        Self {
            router: create_router(state.clone()),
            state,
            store,
            jobs,
        }
    }

    /// Everything queued so far, in order.
    pub fn drain_jobs(&mut self) -> Vec<ScheduledJob> {
        let mut jobs = Vec::new();
        while let Ok(job) = self.jobs.try_recv() {
            jobs.push(job);
        }
        jobs
    }

    /// Session cookie header value for a local user.
    pub fn session_cookie(&self, user_id: u64, active: bool) -> String {
        let token = create_jwt(user_id, active, &self.state.config.jwt_signing_key).unwrap();
        format!("{}={}", SESSION_COOKIE, token)
    }

    /// Claims of a valid Cloud Tasks OIDC token for this app.
    pub fn task_claims(&self) -> serde_json::Value {
        let now = Utc::now().timestamp();
        json!({
            "iss": "https://accounts.google.com",
            "aud": self.state.config.api_url,
            "sub": "109876543210",
            "email": self.state.config.tasks_service_account,
            "email_verified": true,
            "iat": now,
            "exp": now + 300,
        })
    }

    /// A valid Cloud Tasks OIDC token for this app.
    pub fn task_token(&self) -> String {
        sign_task_token(&self.task_claims())
    }

    /// Link `USER_ID` to `FITBIT_USER` with a token valid for another hour.
    pub async fn link_user(&self) -> AccountLink {
        let link = AccountLink::new(USER_ID, FITBIT_USER.to_string(), valid_token("access"), Utc::now());
        self.store.link_account(&link).await.unwrap();
        link
    }
}

/// Sign arbitrary claims with the test tasks key.
#[allow(dead_code)]
pub fn sign_task_token(claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(TASKS_KEY_ID.to_string());
    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(TASKS_PRIVATE_KEY).unwrap(),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn valid_token(access_token: &str) -> OAuthToken {
    OAuthToken {
        access_token: access_token.to_string(),
        refresh_token: format!("{}-refresh", access_token),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

#[allow(dead_code)]
pub fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header("cookie", cookie);
    }
    builder.body(Body::empty()).unwrap()
}

#[allow(dead_code)]
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[allow(dead_code)]
pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
