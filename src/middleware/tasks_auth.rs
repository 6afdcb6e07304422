// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Cloud Tasks authentication for `/tasks/*` routes.

use crate::services::tasks::QUEUE_NAME;
use crate::services::OidcError;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Queue name header set by Cloud Tasks. Anyone can send it, so it only
/// filters misrouted requests; the OIDC token is what authenticates.
pub const QUEUE_NAME_HEADER: &str = "x-cloudtasks-queuename";

/// Require the queue header and a valid Cloud Tasks OIDC token.
///
/// Bad tokens get 403. A failure to fetch Google's keys gets 500 so the
/// queue redelivers.
pub async fn require_tasks_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let queue_name_header = request.headers().get(QUEUE_NAME_HEADER);
    let is_valid_queue = queue_name_header
        .and_then(|h| h.to_str().ok())
        .is_some_and(|name| name == QUEUE_NAME);

    if !is_valid_queue {
        tracing::warn!(
            header = ?queue_name_header,
            "Blocked tasks request with invalid queue header"
        );
        return Err(StatusCode::FORBIDDEN);
    }

    let principal = state
        .google_oidc_verifier
        .verify(request.headers().get(header::AUTHORIZATION))
        .await
        .map_err(|err| match err {
            OidcError::Forbidden(reason) => {
                tracing::warn!(reason = %reason, "Blocked tasks request with invalid OIDC token");
                StatusCode::FORBIDDEN
            }
            OidcError::Transient(reason) => {
                tracing::error!(reason = %reason, "Could not verify tasks OIDC token");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    tracing::debug!(
        email = %principal.email,
        subject = %principal.subject,
        "Verified Cloud Tasks request"
    );

    Ok(next.run(request).await)
}
