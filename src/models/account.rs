// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Account link model: a local user's Fitbit credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth2 token set as returned by Fitbit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Link between a local user and a Fitbit account.
///
/// Stored in Firestore keyed by the local user ID. The Fitbit user ID is
/// unique across links (enforced by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLink {
    /// Local user ID (also used as document ID)
    pub user_id: u64,
    /// Fitbit encoded user ID
    pub fitbit_user: String,
    pub access_token: String,
    pub refresh_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
    /// When the account was (re)linked
    pub linked_at: DateTime<Utc>,
}

impl AccountLink {
    pub fn new(user_id: u64, fitbit_user: String, token: OAuthToken, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            fitbit_user,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token.expires_at,
            linked_at: now,
        }
    }

    pub fn token(&self) -> OAuthToken {
        OAuthToken {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Whether a token obtained by a worker may replace the stored one.
    ///
    /// A concurrent worker may already have stored a newer token; refresh
    /// tokens are single-use, so writing back an older one would break the
    /// link. Only strictly newer, still-valid tokens are accepted.
    pub fn accepts_token(&self, token: &OAuthToken, now: DateTime<Utc>) -> bool {
        token.expires_at > self.expires_at && token.expires_at > now
    }

    pub fn apply_token(&mut self, token: &OAuthToken) {
        self.access_token = token.access_token.clone();
        self.refresh_token = token.refresh_token.clone();
        self.expires_at = token.expires_at;
    }
}
