// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Storage layer: account links and time-series data.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryStore;

use crate::error::AppError;
use crate::models::{AccountLink, DateRange, OAuthToken, TimeSeriesPoint};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Collection names as constants.
pub mod collections {
    /// Account links keyed by local user ID
    pub const ACCOUNT_LINKS: &str = "account_links";
    /// Fitbit user ID -> local user ID, enforces one link per Fitbit account
    pub const FITBIT_USERS: &str = "fitbit_users";
    pub const TIME_SERIES: &str = "time_series";
}

/// Persistence operations needed by the views and background workers.
///
/// Implementations must make `link_account` and `save_token_if_newer`
/// atomic with respect to concurrent callers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_link(&self, user_id: u64) -> Result<Option<AccountLink>, AppError>;

    async fn get_link_by_fitbit_user(
        &self,
        fitbit_user: &str,
    ) -> Result<Option<AccountLink>, AppError>;

    async fn list_links(&self) -> Result<Vec<AccountLink>, AppError>;

    /// Create or replace the link for `link.user_id`.
    ///
    /// Fails with [`AppError::AlreadyLinked`] if the Fitbit account is linked
    /// to a different local user; nothing is written in that case.
    async fn link_account(&self, link: &AccountLink) -> Result<(), AppError>;

    /// Remove the link for a local user, returning it if it existed.
    async fn delete_link(&self, user_id: u64) -> Result<Option<AccountLink>, AppError>;

    /// Store `token` for the user only if [`AccountLink::accepts_token`]
    /// holds against the currently stored link. Returns whether it was saved.
    async fn save_token_if_newer(
        &self,
        user_id: u64,
        token: &OAuthToken,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Insert or overwrite points keyed by (user, resource type, date).
    async fn upsert_time_series(&self, points: &[TimeSeriesPoint]) -> Result<(), AppError>;

    /// Points for one user and resource type within `range`, ordered by date.
    async fn get_time_series(
        &self,
        user_id: u64,
        resource_type_id: u32,
        range: &DateRange,
    ) -> Result<Vec<TimeSeriesPoint>, AppError>;
}
