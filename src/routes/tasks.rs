// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Task handler routes for Cloud Tasks callbacks.
//!
//! These endpoints are called by Cloud Tasks, not directly by users. They
//! answer 200 for every finished job, including rejected ones, so Cloud
//! Tasks does not redeliver; 500 means "try again".

use crate::services::tasks::{Job, SubscribePayload, TimeSeriesPayload, UnsubscribePayload};
use crate::services::worker::{self, TaskOutcome};
use crate::AppState;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::post,
    Router,
};
use std::sync::Arc;

/// Task handler routes (called by Cloud Tasks).
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks/subscribe", post(subscribe))
        .route("/tasks/unsubscribe", post(unsubscribe))
        .route("/tasks/time-series", post(time_series))
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubscribePayload>,
) -> StatusCode {
    run(&state, Job::Subscribe(payload)).await
}

async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UnsubscribePayload>,
) -> StatusCode {
    run(&state, Job::Unsubscribe(payload)).await
}

async fn time_series(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TimeSeriesPayload>,
) -> StatusCode {
    run(&state, Job::TimeSeries(payload)).await
}

async fn run(state: &AppState, job: Job) -> StatusCode {
    let endpoint = job.endpoint();
    match worker::dispatch(state, job).await {
        Ok(TaskOutcome::Rejected(reason)) => {
            tracing::warn!(endpoint, reason = %reason, "Task rejected");
            StatusCode::OK
        }
        Ok(outcome) => {
            tracing::debug!(endpoint, ?outcome, "Task finished");
            StatusCode::OK
        }
        Err(e) => {
            tracing::error!(endpoint, error = %e, "Task failed, requesting redelivery");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
