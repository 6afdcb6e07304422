// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process [`Store`] for local development and tests.

use crate::db::Store;
use crate::error::AppError;
use crate::models::{AccountLink, DateRange, OAuthToken, TimeSeriesPoint};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    links: HashMap<u64, AccountLink>,
    fitbit_users: HashMap<String, u64>,
    time_series: BTreeMap<(u64, u32, NaiveDate), TimeSeriesPoint>,
}

/// Store holding everything in memory behind a single lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_link(&self, user_id: u64) -> Result<Option<AccountLink>, AppError> {
        Ok(self.inner.read().await.links.get(&user_id).cloned())
    }

    async fn get_link_by_fitbit_user(
        &self,
        fitbit_user: &str,
    ) -> Result<Option<AccountLink>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner
            .fitbit_users
            .get(fitbit_user)
            .and_then(|user_id| inner.links.get(user_id))
            .cloned())
    }

    async fn list_links(&self) -> Result<Vec<AccountLink>, AppError> {
        let inner = self.inner.read().await;
        let mut links: Vec<AccountLink> = inner.links.values().cloned().collect();
        links.sort_by_key(|link| link.user_id);
        Ok(links)
    }

    async fn link_account(&self, link: &AccountLink) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;

        if let Some(owner) = inner.fitbit_users.get(&link.fitbit_user) {
            if *owner != link.user_id {
                return Err(AppError::AlreadyLinked(link.fitbit_user.clone()));
            }
        }

        if let Some(previous) = inner.links.insert(link.user_id, link.clone()) {
            if previous.fitbit_user != link.fitbit_user {
                inner.fitbit_users.remove(&previous.fitbit_user);
            }
        }
        inner
            .fitbit_users
            .insert(link.fitbit_user.clone(), link.user_id);

        Ok(())
    }

    async fn delete_link(&self, user_id: u64) -> Result<Option<AccountLink>, AppError> {
        let mut inner = self.inner.write().await;
        let link = inner.links.remove(&user_id);
        if let Some(link) = &link {
            inner.fitbit_users.remove(&link.fitbit_user);
        }
        Ok(link)
    }

    async fn save_token_if_newer(
        &self,
        user_id: u64,
        token: &OAuthToken,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        match inner.links.get_mut(&user_id) {
            Some(link) if link.accepts_token(token, now) => {
                link.apply_token(token);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert_time_series(&self, points: &[TimeSeriesPoint]) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        for point in points {
            inner.time_series.insert(
                (point.user_id, point.resource_type_id, point.date),
                point.clone(),
            );
        }
        Ok(())
    }

    async fn get_time_series(
        &self,
        user_id: u64,
        resource_type_id: u32,
        range: &DateRange,
    ) -> Result<Vec<TimeSeriesPoint>, AppError> {
        let inner = self.inner.read().await;
        let first = (user_id, resource_type_id, NaiveDate::MIN);
        let last = (user_id, resource_type_id, NaiveDate::MAX);
        Ok(inner
            .time_series
            .range(first..=last)
            .map(|(_, point)| point)
            .filter(|point| range.contains(point.date))
            .cloned()
            .collect())
    }
}
