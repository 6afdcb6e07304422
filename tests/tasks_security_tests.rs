// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Task handler routes: Cloud Tasks authentication and status codes.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{sign_task_token, TestApp, FITBIT_USER};
use fitlink::config::Config;
use fitlink::middleware::tasks_auth::QUEUE_NAME_HEADER;
use fitlink::services::tasks::QUEUE_NAME;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn task_request(
    uri: &str,
    queue: Option<&str>,
    token: Option<&str>,
    body: serde_json::Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(queue) = queue {
        builder = builder.header(QUEUE_NAME_HEADER, queue);
    }
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn steps_fetch() -> serde_json::Value {
    json!({
        "fitbit_user": FITBIT_USER,
        "category": "activities",
        "resource": "steps",
        "date": "2013-05-02"
    })
}

#[tokio::test]
async fn test_tasks_require_queue_header() {
    let app = TestApp::new(Config::default(), "http://127.0.0.1:9");
    let token = app.task_token();

    for uri in ["/tasks/subscribe", "/tasks/unsubscribe", "/tasks/time-series"] {
        let response = app
            .router
            .clone()
            .oneshot(task_request(uri, None, Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
    }

    let response = app
        .router
        .oneshot(task_request(
            "/tasks/time-series",
            Some("some-other-queue"),
            Some(&token),
            steps_fetch(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_queue_header_alone_is_not_enough() {
    let app = TestApp::new(Config::default(), "http://127.0.0.1:9");

    for uri in ["/tasks/subscribe", "/tasks/unsubscribe", "/tasks/time-series"] {
        let response = app
            .router
            .clone()
            .oneshot(task_request(uri, Some(QUEUE_NAME), None, steps_fetch()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
    }

    let response = app
        .router
        .oneshot(task_request(
            "/tasks/time-series",
            Some(QUEUE_NAME),
            Some("not.a.jwt"),
            steps_fetch(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_tokens_for_other_identities_are_rejected() {
    let app = TestApp::new(Config::default(), "http://127.0.0.1:9");
    let now = chrono::Utc::now().timestamp();

    let mut wrong_account = app.task_claims();
    wrong_account["email"] = json!("intruder@other-project.iam.gserviceaccount.com");

    let mut wrong_audience = app.task_claims();
    wrong_audience["aud"] = json!("https://other-service.example");

    let mut unverified = app.task_claims();
    unverified["email_verified"] = json!(false);

    let mut wrong_issuer = app.task_claims();
    wrong_issuer["iss"] = json!("https://issuer.example");

    let mut expired = app.task_claims();
    expired["iat"] = json!(now - 7200);
    expired["exp"] = json!(now - 3600);

    for (name, claims) in [
        ("wrong account", wrong_account),
        ("wrong audience", wrong_audience),
        ("unverified email", unverified),
        ("wrong issuer", wrong_issuer),
        ("expired", expired),
    ] {
        let token = sign_task_token(&claims);
        let response = app
            .router
            .clone()
            .oneshot(task_request(
                "/tasks/time-series",
                Some(QUEUE_NAME),
                Some(&token),
                steps_fetch(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", name);
    }
}

#[tokio::test]
async fn test_finished_tasks_return_ok() {
    let app = TestApp::new(Config::default(), "http://127.0.0.1:9");
    let token = app.task_token();

    // No linked account: skipped
    let response = app
        .router
        .clone()
        .oneshot(task_request(
            "/tasks/time-series",
            Some(QUEUE_NAME),
            Some(&token),
            steps_fetch(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Unknown resource: rejected, but not redelivered
    let response = app
        .router
        .clone()
        .oneshot(task_request(
            "/tasks/time-series",
            Some(QUEUE_NAME),
            Some(&token),
            json!({"fitbit_user": FITBIT_USER, "category": "activities", "resource": "wingspan"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .oneshot(task_request(
            "/tasks/subscribe",
            Some(QUEUE_NAME),
            Some(&token),
            json!({"fitbit_user": FITBIT_USER, "subscriber_id": "1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let app = TestApp::new(Config::default(), "http://127.0.0.1:9");
    let token = app.task_token();

    let response = app
        .router
        .oneshot(task_request(
            "/tasks/time-series",
            Some(QUEUE_NAME),
            Some(&token),
            json!({"fitbit_user": FITBIT_USER, "category": "hobbies", "resource": "steps"}),
        ))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_unschedulable_retry_requests_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "10"))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::new(Config::default(), &server.uri());
    app.link_user().await;
    let token = app.task_token();

    // Close the queue so the rate-limit retry cannot be scheduled
    let TestApp { router, jobs, .. } = app;
    drop(jobs);

    let response = router
        .oneshot(task_request(
            "/tasks/time-series",
            Some(QUEUE_NAME),
            Some(&token),
            steps_fetch(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
