// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Time-series data views.
//!
//! Responses are always HTTP 200 with the outcome in `meta.status_code`;
//! only unexpected failures surface as HTTP errors.

use crate::error::Result;
use crate::middleware::MaybeUser;
use crate::models::{Category, ResourceType, TimeSeriesEntry, TimeSeriesQuery};
use crate::services::fitbit::FitbitError;
use crate::services::worker::save_refreshed_token;
use crate::time_utils::format_date;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/fitbit/data/{category}/{*resource}", get(get_data))
        .route("/fitbit/steps", get(get_steps))
}

/// Outcome codes reported in `meta.status_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Ok = 100,
    NotAuthenticated = 101,
    NotIntegrated = 102,
    InvalidCredentials = 103,
    InvalidRequest = 104,
    RateLimited = 105,
    UpstreamError = 106,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataMeta {
    pub total_count: usize,
    pub status_code: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataResponse {
    pub meta: DataMeta,
    pub objects: Vec<TimeSeriesEntry>,
}

impl DataResponse {
    fn new(status: DataStatus, objects: Vec<TimeSeriesEntry>) -> Json<Self> {
        Json(Self {
            meta: DataMeta {
                total_count: objects.len(),
                status_code: status as u16,
            },
            objects,
        })
    }

    fn status(status: DataStatus) -> Json<Self> {
        Self::new(status, Vec::new())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    #[serde(default)]
    base_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    period: Option<String>,
}

async fn get_steps(
    State(state): State<Arc<AppState>>,
    user: MaybeUser,
    Query(params): Query<DataParams>,
) -> Result<Json<DataResponse>> {
    data_response(&state, user, "activities", "steps", params).await
}

async fn get_data(
    State(state): State<Arc<AppState>>,
    user: MaybeUser,
    Path((category, resource)): Path<(String, String)>,
    Query(params): Query<DataParams>,
) -> Result<Json<DataResponse>> {
    data_response(&state, user, &category, &resource, params).await
}

async fn data_response(
    state: &AppState,
    MaybeUser(user): MaybeUser,
    category: &str,
    resource: &str,
    params: DataParams,
) -> Result<Json<DataResponse>> {
    let Some(resource_type) = category
        .parse::<Category>()
        .ok()
        .and_then(|c| ResourceType::find(c, resource))
    else {
        return Ok(DataResponse::status(DataStatus::InvalidRequest));
    };

    let Some(user) = user.filter(|u| u.active) else {
        return Ok(DataResponse::status(DataStatus::NotAuthenticated));
    };

    let link = state.store.get_link(user.user_id).await?;
    if !state.config.subscribe && link.is_none() {
        return Ok(DataResponse::status(DataStatus::NotIntegrated));
    }

    let query = match TimeSeriesQuery::from_params(
        params.base_date.as_deref(),
        params.end_date.as_deref(),
        params.period.as_deref(),
    ) {
        Ok(q) => q,
        Err(e) => {
            tracing::debug!(error = %e, "Invalid data query");
            return Ok(DataResponse::status(DataStatus::InvalidRequest));
        }
    };

    if state.config.subscribe {
        let range = query.local_range(Utc::now().date_naive());
        let objects = state
            .store
            .get_time_series(user.user_id, resource_type.id, &range)
            .await?
            .into_iter()
            .map(|p| TimeSeriesEntry {
                date_time: format_date(p.date),
                value: p.value,
            })
            .collect();
        return Ok(DataResponse::new(DataStatus::Ok, objects));
    }

    let Some(link) = link else {
        return Ok(DataResponse::status(DataStatus::NotIntegrated));
    };

    let mut session = state.fitbit.session(&link.fitbit_user, link.token());
    let result = session.time_series(resource_type, &query).await;
    save_refreshed_token(state.store.as_ref(), link.user_id, &session).await;

    match result {
        Ok(objects) => Ok(DataResponse::new(DataStatus::Ok, objects)),
        Err(e) if e.is_credentials_error() => {
            tracing::warn!(
                user_id = user.user_id,
                error = %e,
                "Fitbit rejected credentials, removing link"
            );
            state.store.delete_link(user.user_id).await?;
            Ok(DataResponse::status(DataStatus::InvalidCredentials))
        }
        Err(e) if e.is_rate_limited() => Ok(DataResponse::status(DataStatus::RateLimited)),
        Err(FitbitError::Server { status }) => {
            tracing::warn!(status, "Fitbit server error");
            Ok(DataResponse::status(DataStatus::UpstreamError))
        }
        Err(e) => Err(e.into()),
    }
}
