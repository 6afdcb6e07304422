// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Background job execution against a mocked Fitbit API.

mod common;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use common::{valid_token, TestApp, FITBIT_USER, USER_ID};
use fitlink::config::Config;
use fitlink::db::Store;
use fitlink::models::{AccountLink, Category, OAuthToken, ResourceType, TimeSeriesQuery};
use fitlink::services::lock::{LockCache, LOCK_EXPIRE};
use fitlink::services::tasks::{SubscribePayload, TimeSeriesPayload, UnsubscribePayload};
use fitlink::services::worker::{self, save_refreshed_token};
use fitlink::services::{Job, TaskOutcome};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STEPS_PATH: &str = "/1/user/228TQ4/activities/steps/date/2013-05-02/2013-05-02.json";

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2013, 5, 2).unwrap()
}

fn fetch(resource: &str, retries: u32) -> Job {
    Job::TimeSeries(TimeSeriesPayload {
        fitbit_user: FITBIT_USER.to_string(),
        category: Category::Activities,
        resource: resource.to_string(),
        date: Some(day()),
        retries,
    })
}

fn steps_body() -> serde_json::Value {
    json!({"activities-steps": [{"dateTime": "2013-05-02", "value": "1234"}]})
}

#[tokio::test]
async fn test_fetch_stores_points() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .and(header("authorization", "Bearer access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(steps_body()))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let outcome = worker::dispatch(&app.state, fetch("steps", 0)).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    let steps = ResourceType::find(Category::Activities, "steps").unwrap();
    let points = app
        .store
        .get_time_series(USER_ID, steps.id, &TimeSeriesQuery::day(day()).local_range(day()))
        .await
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value.as_deref(), Some("1234"));

    let key = LockCache::fetch_key(FITBIT_USER, "activities/steps", Some(day()));
    assert!(!app.state.locks.is_held(&key));
}

#[tokio::test]
async fn test_held_lock_skips_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(steps_body()))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let key = LockCache::fetch_key(FITBIT_USER, "activities/steps", Some(day()));
    let _guard = app.state.locks.try_acquire(&key, LOCK_EXPIRE).unwrap();

    let outcome = worker::dispatch(&app.state, fetch("steps", 0)).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Skipped("lock held"));
}

#[tokio::test]
async fn test_missing_link_skips_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());

    let outcome = worker::dispatch(&app.state, fetch("steps", 0)).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Skipped("no linked account"));
}

#[tokio::test]
async fn test_unknown_resource_is_rejected() {
    let app = TestApp::new(Config::default(), "http://127.0.0.1:9");
    let outcome = worker::dispatch(&app.state, fetch("wingspan", 0)).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Rejected(_)));
}

#[tokio::test]
async fn test_rate_limit_reschedules_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .expect(1)
        .mount(&server)
        .await;

    let mut app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let outcome = worker::dispatch(&app.state, fetch("steps", 0)).await.unwrap();
    let TaskOutcome::Retrying { countdown } = outcome else {
        panic!("expected a retry, got {:?}", outcome);
    };
    // Retry-After plus floor(x^0) for the first retry
    assert_eq!(countdown, Duration::from_secs(31));

    let jobs = app.drain_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].countdown, countdown);
    assert_eq!(jobs[0].job, fetch("steps", 1));

    // Released so the retry can take it
    let key = LockCache::fetch_key(FITBIT_USER, "activities/steps", Some(day()));
    assert!(!app.state.locks.is_held(&key));
}

#[tokio::test]
async fn test_rate_limit_backoff_grows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;

    let mut app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    worker::dispatch(&app.state, fetch("steps", 2)).await.unwrap();
    let jobs = app.drain_jobs();
    assert_eq!(jobs.len(), 1);
    // 30 + floor(uniform(2, 4)^2)
    let secs = jobs[0].countdown.as_secs();
    assert!((34..=45).contains(&secs), "got {secs}");
    assert_eq!(jobs[0].job, fetch("steps", 3));
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .expect(1)
        .mount(&server)
        .await;

    let mut app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let max = app.state.config.fitbit_max_retries;
    let outcome = worker::dispatch(&app.state, fetch("steps", max)).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Rejected(_)));
    assert!(app.drain_jobs().is_empty());
}

#[tokio::test]
async fn test_elevation_without_device_data_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(
            "/1/user/228TQ4/activities/elevation/date/2013-05-02/2013-05-02.json",
        ))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{"errorType": "validation", "message": "Invalid time series resource path"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let outcome = worker::dispatch(&app.state, fetch("elevation", 0)).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Skipped("no device data"));
}

#[tokio::test]
async fn test_unauthorized_fetch_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errors": [{"errorType": "invalid_token"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let outcome = worker::dispatch(&app.state, fetch("steps", 0)).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Rejected(_)));
    assert!(app.drain_jobs().is_empty());
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_stored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("refresh_token=stale-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "refresh_token": "fresh-refresh",
            "expires_in": 28800,
            "user_id": FITBIT_USER
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(steps_body()))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    let expired = OAuthToken {
        access_token: "stale".to_string(),
        refresh_token: "stale-refresh".to_string(),
        expires_at: Utc::now() - ChronoDuration::minutes(5),
    };
    let link = AccountLink::new(USER_ID, FITBIT_USER.to_string(), expired, Utc::now());
    app.store.link_account(&link).await.unwrap();

    let outcome = worker::dispatch(&app.state, fetch("steps", 0)).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);

    let stored = app.store.get_link(USER_ID).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "fresh");
    assert_eq!(stored.refresh_token, "fresh-refresh");
}

#[tokio::test]
async fn test_older_refreshed_token_does_not_overwrite_newer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "B",
            "refresh_token": "B-refresh",
            "expires_in": 600,
            "user_id": FITBIT_USER
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(STEPS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(steps_body()))
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());

    // Another worker already stored token A, which outlives the one we get
    app.link_user().await;
    let stored_before = app.store.get_link(USER_ID).await.unwrap().unwrap();

    let expired = OAuthToken {
        access_token: "old".to_string(),
        refresh_token: "old-refresh".to_string(),
        expires_at: Utc::now() - ChronoDuration::minutes(1),
    };
    let mut session = app.state.fitbit.session(FITBIT_USER, expired);
    let steps = ResourceType::find(Category::Activities, "steps").unwrap();
    session
        .time_series(steps, &TimeSeriesQuery::day(day()))
        .await
        .unwrap();
    assert!(session.refreshed());

    save_refreshed_token(app.store.as_ref(), USER_ID, &session).await;

    let stored = app.store.get_link(USER_ID).await.unwrap().unwrap();
    assert_eq!(stored.access_token, stored_before.access_token);
    assert_eq!(stored.expires_at, stored_before.expires_at);
}

#[tokio::test]
async fn test_subscribe_registers_subscription() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1/user/-/apiSubscriptions/42.json"))
        .and(header("X-Fitbit-Subscriber-Id", "1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "collectionType": "user",
            "ownerId": FITBIT_USER,
            "ownerType": "user",
            "subscriberId": "1",
            "subscriptionId": "42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;

    let job = Job::Subscribe(SubscribePayload {
        fitbit_user: FITBIT_USER.to_string(),
        subscriber_id: "1".to_string(),
    });
    let outcome = worker::dispatch(&app.state, job).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);
}

#[tokio::test]
async fn test_unsubscribe_removes_only_owned_subscriptions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1/user/-/apiSubscriptions.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "apiSubscriptions": [
                {"ownerId": FITBIT_USER, "subscriberId": "1", "subscriptionId": "42"},
                {"ownerId": "OTHER", "subscriberId": "1", "subscriptionId": "43"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/1/user/-/apiSubscriptions/42.json"))
        .and(header("X-Fitbit-Subscriber-Id", "1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/1/user/-/apiSubscriptions/43.json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    let token = valid_token("gone");
    let job = Job::Unsubscribe(UnsubscribePayload {
        fitbit_user: FITBIT_USER.to_string(),
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: token.expires_at,
    });

    let outcome = worker::dispatch(&app.state, job).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Completed);
}
