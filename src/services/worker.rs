// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Execution of background jobs.
//!
//! Every job ends in a [`TaskOutcome`]. Fitbit failures are outcomes, not
//! errors: `Err` is reserved for failures the queue should redeliver on
//! (storage errors, or a rate-limit retry that could not be scheduled).

use crate::db::Store;
use crate::error::Result;
use crate::models::{ResourceType, TimeSeriesPoint, TimeSeriesQuery};
use crate::services::fitbit::{FitbitError, FitbitSession};
use crate::services::lock::{LockCache, LOCK_EXPIRE};
use crate::services::tasks::{Job, SubscribePayload, TimeSeriesPayload, UnsubscribePayload};
use crate::time_utils::parse_date;
use crate::AppState;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;

/// How a job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Nothing to do (lock held, link gone, no device data)
    Skipped(&'static str),
    /// Rescheduled after a rate limit
    Retrying { countdown: Duration },
    /// Failed permanently; not retried
    Rejected(String),
}

/// Run one job.
pub async fn dispatch(state: &AppState, job: Job) -> Result<TaskOutcome> {
    match job {
        Job::Subscribe(payload) => subscribe(state, payload).await,
        Job::Unsubscribe(payload) => unsubscribe(state, payload).await,
        Job::TimeSeries(payload) => fetch_time_series(state, payload).await,
    }
}

/// Persist a token the session refreshed, unless a newer one is stored.
pub async fn save_refreshed_token(store: &dyn Store, user_id: u64, session: &FitbitSession) {
    if !session.refreshed() {
        return;
    }

    match store
        .save_token_if_newer(user_id, session.token(), Utc::now())
        .await
    {
        Ok(true) => tracing::debug!(user_id, "Stored refreshed Fitbit token"),
        Ok(false) => tracing::debug!(user_id, "Refreshed token superseded by stored token"),
        Err(e) => tracing::error!(user_id, error = %e, "Failed to store refreshed token"),
    }
}

/// Past this many retries the backoff term no longer grows.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Delay before retrying a rate-limited fetch: the server's Retry-After
/// plus `floor(uniform(2, 4) ^ retries)` seconds, saturating.
pub fn retry_countdown(retry_after_secs: u64, retries: u32, rng: &mut impl Rng) -> Duration {
    let base: f64 = rng.random_range(2.0..4.0);
    let exponent = retries.min(MAX_BACKOFF_EXPONENT) as i32;
    // Float to int casts saturate
    let backoff = base.powi(exponent).floor() as u64;
    Duration::from_secs(retry_after_secs.saturating_add(backoff))
}

async fn subscribe(state: &AppState, payload: SubscribePayload) -> Result<TaskOutcome> {
    let Some(link) = state
        .store
        .get_link_by_fitbit_user(&payload.fitbit_user)
        .await?
    else {
        tracing::warn!(fitbit_user = %payload.fitbit_user, "Subscribe: no linked account");
        return Ok(TaskOutcome::Skipped("no linked account"));
    };

    let mut session = state.fitbit.session(&link.fitbit_user, link.token());
    let result = session
        .add_subscription(&link.user_id.to_string(), &payload.subscriber_id)
        .await;
    save_refreshed_token(state.store.as_ref(), link.user_id, &session).await;

    match result {
        Ok(()) => {
            tracing::info!(
                user_id = link.user_id,
                fitbit_user = %link.fitbit_user,
                "Subscribed to Fitbit notifications"
            );
            Ok(TaskOutcome::Completed)
        }
        Err(e) => {
            tracing::error!(fitbit_user = %link.fitbit_user, error = %e, "Error subscribing user");
            Ok(TaskOutcome::Rejected(e.to_string()))
        }
    }
}

async fn unsubscribe(state: &AppState, payload: UnsubscribePayload) -> Result<TaskOutcome> {
    let token = crate::models::OAuthToken {
        access_token: payload.access_token,
        refresh_token: payload.refresh_token,
        expires_at: payload.expires_at,
    };
    // The link is already deleted, so a refreshed token here is discarded.
    let mut session = state.fitbit.session(&payload.fitbit_user, token);

    let result: std::result::Result<usize, FitbitError> = async {
        let mut removed = 0;
        for sub in session.list_subscriptions().await? {
            if sub.owner_id == payload.fitbit_user {
                session
                    .delete_subscription(&sub.subscription_id, &sub.subscriber_id)
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
    .await;

    match result {
        Ok(removed) => {
            tracing::info!(fitbit_user = %payload.fitbit_user, removed, "Unsubscribed user");
            Ok(TaskOutcome::Completed)
        }
        Err(e) => {
            tracing::error!(
                fitbit_user = %payload.fitbit_user,
                error = %e,
                "Error unsubscribing user"
            );
            Ok(TaskOutcome::Rejected(e.to_string()))
        }
    }
}

async fn fetch_time_series(state: &AppState, payload: TimeSeriesPayload) -> Result<TaskOutcome> {
    let Some(resource_type) = ResourceType::find(payload.category, &payload.resource) else {
        tracing::error!(
            category = %payload.category,
            resource = %payload.resource,
            "Unknown resource type"
        );
        return Ok(TaskOutcome::Rejected(format!(
            "unknown resource {}/{}",
            payload.category, payload.resource
        )));
    };

    let key = LockCache::fetch_key(&payload.fitbit_user, &resource_type.path(), payload.date);
    let Some(guard) = state.locks.try_acquire(&key, LOCK_EXPIRE) else {
        tracing::debug!(lock = %key, "Fetch already in progress, skipping");
        return Ok(TaskOutcome::Skipped("lock held"));
    };

    let Some(link) = state
        .store
        .get_link_by_fitbit_user(&payload.fitbit_user)
        .await?
    else {
        tracing::debug!(fitbit_user = %payload.fitbit_user, "No linked account, skipping fetch");
        return Ok(TaskOutcome::Skipped("no linked account"));
    };

    let query = payload
        .date
        .map(TimeSeriesQuery::day)
        .unwrap_or_else(TimeSeriesQuery::all_time);

    let mut session = state.fitbit.session(&link.fitbit_user, link.token());
    let result = session.time_series(resource_type, &query).await;
    save_refreshed_token(state.store.as_ref(), link.user_id, &session).await;

    let entries = match result {
        Ok(entries) => entries,
        Err(FitbitError::TooManyRequests { retry_after_secs }) => {
            drop(guard);
            return retry_rate_limited(state, payload, retry_after_secs).await;
        }
        Err(FitbitError::BadRequest(_)) if resource_type.missing_data_is_bad_request() => {
            tracing::debug!(
                fitbit_user = %link.fitbit_user,
                resource = %resource_type,
                "No device data for resource"
            );
            return Ok(TaskOutcome::Skipped("no device data"));
        }
        Err(e) => {
            tracing::error!(
                fitbit_user = %link.fitbit_user,
                resource = %resource_type,
                error = %e,
                "Error fetching time series"
            );
            return Ok(TaskOutcome::Rejected(e.to_string()));
        }
    };

    let points: Vec<TimeSeriesPoint> = entries
        .into_iter()
        .filter_map(|entry| match parse_date(&entry.date_time) {
            Some(date) => Some(TimeSeriesPoint {
                user_id: link.user_id,
                resource_type_id: resource_type.id,
                date,
                value: entry.value,
            }),
            None => {
                tracing::warn!(date = %entry.date_time, "Skipping entry with bad date");
                None
            }
        })
        .collect();

    state.store.upsert_time_series(&points).await?;

    tracing::info!(
        user_id = link.user_id,
        resource = %resource_type,
        count = points.len(),
        "Stored time series"
    );

    Ok(TaskOutcome::Completed)
}

async fn retry_rate_limited(
    state: &AppState,
    payload: TimeSeriesPayload,
    retry_after_secs: u64,
) -> Result<TaskOutcome> {
    if payload.retries >= state.config.fitbit_max_retries {
        tracing::error!(
            fitbit_user = %payload.fitbit_user,
            retries = payload.retries,
            "Rate limited and out of retries"
        );
        return Ok(TaskOutcome::Rejected("rate limit retries exhausted".to_string()));
    }

    let countdown = retry_countdown(retry_after_secs, payload.retries, &mut rand::rng());
    let retry = TimeSeriesPayload {
        retries: payload.retries + 1,
        ..payload
    };

    tracing::warn!(
        fitbit_user = %retry.fitbit_user,
        resource = %retry.resource,
        retries = retry.retries,
        countdown_secs = countdown.as_secs(),
        "Rate limited, rescheduling fetch"
    );

    state
        .queue
        .enqueue(Job::TimeSeries(retry), countdown)
        .await?;

    Ok(TaskOutcome::Retrying { countdown })
}
