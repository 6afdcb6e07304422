// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bulk token refresh, run from the `refresh-tokens` command.

use crate::db::Store;
use crate::error::Result;
use crate::services::fitbit::{FitbitClient, FitbitError};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    /// Refresh every token, not just expired ones
    pub all: bool,
    /// Delete links whose refresh token Fitbit rejects
    pub deauth: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub deauthorized: usize,
}

impl RefreshSummary {
    /// Lines reported to the operator.
    pub fn report(&self, options: RefreshOptions) -> Vec<String> {
        let mut lines = vec![format!("Successfully refreshed {} tokens", self.refreshed)];
        if self.failed > 0 {
            lines.push(format!("Failed to refresh {} tokens", self.failed));
        }
        if options.deauth {
            lines.push(format!("Deauthenticated {} users", self.deauthorized));
        }
        lines
    }
}

/// Refresh stored tokens.
pub async fn refresh_tokens(
    store: &dyn Store,
    client: &FitbitClient,
    options: RefreshOptions,
    now: DateTime<Utc>,
) -> Result<RefreshSummary> {
    let mut summary = RefreshSummary::default();

    for link in store.list_links().await? {
        if !options.all && link.expires_at >= now {
            continue;
        }

        match client.refresh(&link.refresh_token).await {
            Ok(grant) => {
                store
                    .save_token_if_newer(link.user_id, &grant.token, now)
                    .await?;
                summary.refreshed += 1;
            }
            Err(FitbitError::InvalidGrant) => {
                summary.failed += 1;
                tracing::warn!(user_id = link.user_id, "Refresh token rejected");
                if options.deauth {
                    store.delete_link(link.user_id).await?;
                    summary.deauthorized += 1;
                }
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(user_id = link.user_id, error = %e, "Token refresh failed");
            }
        }
    }

    Ok(summary)
}
