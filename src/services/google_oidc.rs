// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Verification of the Google-signed OIDC tokens Cloud Tasks attaches to
//! task requests.
//!
//! Cloud Tasks signs an ID token for the queue's service account with the
//! service URL as audience. Anything else reaching `/tasks/*` is refused.

use crate::config::Config;
use anyhow::Context;
use axum::http::HeaderValue;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEYS_TTL: Duration = Duration::from_secs(300);
const LEEWAY_SECS: u64 = 60;

/// The service account a task request was verified as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPrincipal {
    pub email: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OidcError {
    /// Missing, malformed or wrongly issued token
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Signing keys could not be fetched; the queue should retry
    #[error("transient: {0}")]
    Transient(String),
}

enum KeySource {
    Google,
    Static {
        kid: String,
        key: Arc<DecodingKey>,
    },
}

struct CachedKeys {
    by_kid: HashMap<String, Arc<DecodingKey>>,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct TaskTokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<bool>,
}

/// Checks task request bearer tokens against Google's signing keys.
pub struct GoogleOidcVerifier {
    http: reqwest::Client,
    audience: String,
    service_account: String,
    source: KeySource,
    cache: RwLock<Option<CachedKeys>>,
    refresh_lock: Mutex<()>,
}

impl GoogleOidcVerifier {
    /// Verifier that fetches and caches Google's published keys.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let verifier = Self::build(config, KeySource::Google)?;
        tracing::info!(
            audience = %verifier.audience,
            service_account = %verifier.service_account,
            "Cloud Tasks OIDC verifier ready"
        );
        Ok(verifier)
    }

    /// Verifier that trusts a single fixed RSA key, for local testing.
    pub fn with_static_key(
        config: &Config,
        kid: impl Into<String>,
        key: DecodingKey,
    ) -> anyhow::Result<Self> {
        let kid = kid.into();
        if kid.trim().is_empty() {
            anyhow::bail!("static OIDC key id must not be empty");
        }
        Self::build(
            config,
            KeySource::Static {
                kid,
                key: Arc::new(key),
            },
        )
    }

    fn build(config: &Config, source: KeySource) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed building OIDC HTTP client")?;

        Ok(Self {
            http,
            audience: config.api_url.trim_end_matches('/').to_string(),
            service_account: config.tasks_service_account.clone(),
            source,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Verify the `Authorization: Bearer` token of a task request.
    pub async fn verify(
        &self,
        auth_header: Option<&HeaderValue>,
    ) -> Result<TaskPrincipal, OidcError> {
        let token = bearer_token(auth_header)?;

        let header = decode_header(token)
            .map_err(|e| OidcError::Forbidden(format!("invalid JWT header: {e}")))?;
        if header.alg != Algorithm::RS256 {
            return Err(OidcError::Forbidden(format!(
                "unexpected JWT alg: {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| OidcError::Forbidden("missing JWT kid".to_string()))?;
        let key = self.key_for(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation.set_audience(&[self.audience.as_str()]);
        validation.leeway = LEEWAY_SECS;

        let claims = decode::<TaskTokenClaims>(token, &key, &validation)
            .map_err(|e| OidcError::Forbidden(format!("JWT validation failed: {e}")))?
            .claims;

        let email = claims
            .email
            .ok_or_else(|| OidcError::Forbidden("missing email claim".to_string()))?;
        if email != self.service_account {
            return Err(OidcError::Forbidden(format!(
                "unexpected service account: {email}"
            )));
        }
        if claims.email_verified != Some(true) {
            return Err(OidcError::Forbidden("email is not verified".to_string()));
        }

        Ok(TaskPrincipal {
            email,
            subject: claims.sub,
        })
    }

    async fn key_for(&self, kid: &str) -> Result<Arc<DecodingKey>, OidcError> {
        if let KeySource::Static { kid: known, key } = &self.source {
            return if kid == known {
                Ok(key.clone())
            } else {
                Err(OidcError::Forbidden(format!("unknown JWT kid: {kid}")))
            };
        }

        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }

        // Google rotates keys; an unknown kid forces one refetch.
        for force in [false, true] {
            self.refresh_keys(force).await?;
            if let Some(key) = self.cached_key(kid).await {
                return Ok(key);
            }
        }

        Err(OidcError::Forbidden(format!("unknown JWT kid: {kid}")))
    }

    async fn cached_key(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.expires_at > Instant::now())
            .and_then(|cached| cached.by_kid.get(kid).cloned())
    }

    async fn refresh_keys(&self, force: bool) -> Result<(), OidcError> {
        let _guard = self.refresh_lock.lock().await;

        if !force
            && self
                .cache
                .read()
                .await
                .as_ref()
                .is_some_and(|cached| cached.expires_at > Instant::now())
        {
            return Ok(());
        }

        let response = self
            .http
            .get(GOOGLE_JWKS_URL)
            .send()
            .await
            .map_err(|e| OidcError::Transient(format!("JWKS request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(OidcError::Transient(format!(
                "JWKS request returned {}",
                response.status()
            )));
        }

        let ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age)
            .unwrap_or(DEFAULT_KEYS_TTL);

        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| OidcError::Transient(format!("invalid JWKS: {e}")))?;

        let by_kid: HashMap<_, _> = jwks
            .keys
            .into_iter()
            .filter(|jwk| jwk.kty == "RSA" && jwk.alg.as_deref().unwrap_or("RS256") == "RS256")
            .filter_map(|jwk| match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => Some((jwk.kid, Arc::new(key))),
                Err(e) => {
                    tracing::warn!(kid = %jwk.kid, error = %e, "Skipping unusable JWKS key");
                    None
                }
            })
            .collect();

        if by_kid.is_empty() {
            return Err(OidcError::Transient("JWKS has no usable RSA keys".to_string()));
        }

        tracing::debug!(keys = by_kid.len(), ttl_secs = ttl.as_secs(), "Refreshed Google JWKS");
        *self.cache.write().await = Some(CachedKeys {
            by_kid,
            expires_at: Instant::now() + ttl,
        });

        Ok(())
    }
}

fn bearer_token(auth_header: Option<&HeaderValue>) -> Result<&str, OidcError> {
    let value = auth_header
        .ok_or_else(|| OidcError::Forbidden("missing Authorization header".to_string()))?
        .to_str()
        .map_err(|_| OidcError::Forbidden("invalid Authorization header".to_string()))?;

    value
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or_else(|| OidcError::Forbidden("expected a Bearer token".to_string()))
}

/// `max-age` from a Cache-Control header.
fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|secs| secs.trim_matches('"').parse().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_control_max_age() {
        assert_eq!(
            max_age("public, max-age=19008, must-revalidate, no-transform"),
            Some(Duration::from_secs(19008))
        );
        assert_eq!(max_age("max-age=\"60\""), Some(Duration::from_secs(60)));
        assert_eq!(max_age("no-cache"), None);
        assert_eq!(max_age("max-age=soon"), None);
    }

    #[test]
    fn bearer_token_errors() {
        assert!(matches!(bearer_token(None), Err(OidcError::Forbidden(_))));

        let basic = HeaderValue::from_static("Basic abc");
        assert!(matches!(bearer_token(Some(&basic)), Err(OidcError::Forbidden(_))));

        let empty = HeaderValue::from_static("Bearer ");
        assert!(matches!(bearer_token(Some(&empty)), Err(OidcError::Forbidden(_))));

        let ok = HeaderValue::from_static("Bearer abc.def.ghi");
        assert_eq!(bearer_token(Some(&ok)), Ok("abc.def.ghi"));
    }

    #[test]
    fn static_key_needs_an_id() {
        let key = DecodingKey::from_secret(b"unused");
        assert!(GoogleOidcVerifier::with_static_key(&Config::default(), " ", key).is_err());
    }
}
