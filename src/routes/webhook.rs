// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit subscriber endpoint.
//!
//! GET answers Fitbit's verification handshake; POST receives change
//! notifications and queues one fetch per affected resource.

use crate::models::Category;
use crate::services::tasks::{Job, TimeSeriesPayload};
use crate::time_utils::parse_date;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{header, StatusCode},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/fitbit/update", get(verify).post(update))
}

#[derive(Deserialize)]
struct VerifyParams {
    #[serde(default)]
    verify: Option<String>,
}

/// Subscriber verification: 204 for the right code, 404 otherwise.
async fn verify(State(state): State<Arc<AppState>>, Query(params): Query<VerifyParams>) -> StatusCode {
    let matches = match (&params.verify, &state.config.verification_code) {
        (Some(given), Some(expected)) => bool::from(given.as_bytes().ct_eq(expected.as_bytes())),
        _ => false,
    };

    if matches {
        tracing::info!("Fitbit subscriber verified");
        StatusCode::NO_CONTENT
    } else {
        tracing::warn!(
            provided = params.verify.is_some(),
            "Fitbit subscriber verification failed"
        );
        StatusCode::NOT_FOUND
    }
}

/// One element of a notification payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNotification {
    collection_type: String,
    date: String,
    owner_id: String,
}

/// A notification that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Notification {
    collection_type: String,
    date: NaiveDate,
    owner_id: String,
}

/// Parse the whole payload; any bad element rejects all of it.
fn parse_notifications(body: &[u8]) -> Option<Vec<Notification>> {
    let raw: Vec<RawNotification> = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed Fitbit notification payload");
            return None;
        }
    };

    raw.into_iter()
        .map(|n| {
            let date = parse_date(&n.date);
            if date.is_none() {
                tracing::warn!(date = %n.date, "Bad date in Fitbit notification");
            }
            Some(Notification {
                collection_type: n.collection_type,
                date: date?,
                owner_id: n.owner_id,
            })
        })
        .collect()
}

/// Pull the JSON payload out of the body, or out of the `updates` field of
/// a multipart form.
async fn read_payload(state: &Arc<AppState>, request: Request) -> Option<Bytes> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if !is_multipart {
        return Bytes::from_request(request, state).await.ok();
    }

    let mut multipart = Multipart::from_request(request, state).await.ok()?;
    while let Some(field) = multipart.next_field().await.ok()? {
        if field.name() == Some("updates") {
            return field.bytes().await.ok();
        }
    }
    tracing::warn!("Multipart notification without an updates field");
    None
}

/// Receive change notifications.
async fn update(State(state): State<Arc<AppState>>, request: Request) -> StatusCode {
    let Some(body) = read_payload(&state, request).await else {
        return StatusCode::NOT_FOUND;
    };
    let Some(notifications) = parse_notifications(&body) else {
        return StatusCode::NOT_FOUND;
    };

    let between = state.config.between_delay;

    for notification in notifications {
        let category: Category = match notification.collection_type.parse() {
            Ok(c) => c,
            Err(_) => {
                tracing::warn!(
                    collection_type = %notification.collection_type,
                    "Ignoring notification for unknown collection type"
                );
                continue;
            }
        };

        let resources = state.config.resources_for(category);
        tracing::info!(
            fitbit_user = %notification.owner_id,
            category = %category,
            date = %notification.date,
            resources = resources.len(),
            "Fitbit notification received"
        );

        for (i, resource_type) in resources.into_iter().enumerate() {
            let job = Job::TimeSeries(TimeSeriesPayload {
                fitbit_user: notification.owner_id.clone(),
                category,
                resource: resource_type.resource.to_string(),
                date: Some(notification.date),
                retries: 0,
            });
            if let Err(e) = state.queue.enqueue(job, between * i as u32).await {
                tracing::error!(
                    fitbit_user = %notification.owner_id,
                    resource = %resource_type,
                    error = %e,
                    "Failed to queue time series fetch"
                );
            }
        }
    }

    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_payload() {
        let body = br#"[
            {"collectionType":"activities","date":"2013-05-02","ownerId":"ABC","ownerType":"user","subscriptionId":"1"},
            {"collectionType":"foods","date":"2013-05-03","ownerId":"ABC","ownerType":"user","subscriptionId":"1"}
        ]"#;
        let parsed = parse_notifications(body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].collection_type, "activities");
        assert_eq!(parsed[1].date, NaiveDate::from_ymd_opt(2013, 5, 3).unwrap());
    }

    #[test]
    fn one_bad_element_rejects_everything() {
        let missing_owner = br#"[
            {"collectionType":"activities","date":"2013-05-02","ownerId":"ABC"},
            {"collectionType":"foods","date":"2013-05-03"}
        ]"#;
        assert!(parse_notifications(missing_owner).is_none());

        let bad_date = br#"[{"collectionType":"foods","date":"yesterday","ownerId":"ABC"}]"#;
        assert!(parse_notifications(bad_date).is_none());

        assert!(parse_notifications(b"not json").is_none());
        assert!(parse_notifications(br#"{"collectionType":"foods"}"#).is_none());
    }

    #[test]
    fn empty_list_is_valid() {
        assert_eq!(parse_notifications(b"[]"), Some(Vec::new()));
    }
}
