// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Background job queue.
//!
//! Jobs are scheduled with a countdown and run later by [`crate::services::worker`]:
//! - In production, as Cloud Tasks HTTP tasks posting to `/tasks/*`
//! - Locally, through an in-process channel drained by [`run_local_worker`]

use crate::error::{AppError, Result};
use crate::models::Category;
use crate::AppState;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Cloud Tasks queue receiving all Fitbit jobs.
pub const QUEUE_NAME: &str = "fitbit-tasks";

/// Register the push subscription for a newly linked user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub fitbit_user: String,
    pub subscriber_id: String,
}

/// Remove a user's push subscriptions.
///
/// Carries the tokens since the link is already gone when this runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    pub fitbit_user: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Fetch one resource for one user, for a single day or all time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPayload {
    pub fitbit_user: String,
    pub category: Category,
    pub resource: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Rate-limit reschedules so far
    #[serde(default)]
    pub retries: u32,
}

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    TimeSeries(TimeSeriesPayload),
}

impl Job {
    /// Task handler path the job is delivered to.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Job::Subscribe(_) => "/tasks/subscribe",
            Job::Unsubscribe(_) => "/tasks/unsubscribe",
            Job::TimeSeries(_) => "/tasks/time-series",
        }
    }

    /// JSON body posted to [`Job::endpoint`] (the bare payload).
    fn body(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Job::Subscribe(p) => serde_json::to_vec(p),
            Job::Unsubscribe(p) => serde_json::to_vec(p),
            Job::TimeSeries(p) => serde_json::to_vec(p),
        }
    }
}

/// Somewhere jobs can be scheduled.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule `job` to run `countdown` from now.
    async fn enqueue(&self, job: Job, countdown: Duration) -> Result<()>;
}

/// Cloud Tasks queue.
pub struct CloudTasksQueue {
    project_id: String,
    location: String,
    queue_name: String,
    service_url: String,
    /// Identity Cloud Tasks signs the OIDC token for
    service_account: String,
}

impl CloudTasksQueue {
    pub fn new(project_id: &str, region: &str, service_url: &str, service_account: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            location: region.to_string(),
            queue_name: QUEUE_NAME.to_string(),
            service_url: service_url.trim_end_matches('/').to_string(),
            service_account: service_account.to_string(),
        }
    }
}

#[async_trait]
impl TaskQueue for CloudTasksQueue {
    async fn enqueue(&self, job: Job, countdown: Duration) -> Result<()> {
        use google_cloud_tasks_v2::client::CloudTasks;
        use google_cloud_tasks_v2::model::{HttpRequest, OidcToken, Task};

        let client = CloudTasks::builder()
            .build()
            .await
            .map_err(|e| AppError::TaskQueue(format!("Cloud Tasks client error: {}", e)))?;

        let queue_path = format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location, self.queue_name
        );

        let body = job
            .body()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("JSON error: {}", e)))?;

        let http_request = HttpRequest::default()
            .set_url(format!("{}{}", self.service_url, job.endpoint()))
            .set_http_method("POST")
            .set_body(axum::body::Bytes::from(body))
            .set_headers(std::collections::HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]))
            .set_oidc_token(
                OidcToken::default()
                    .set_service_account_email(self.service_account.clone())
                    .set_audience(self.service_url.clone()),
            );

        let run_at = i64::try_from(countdown.as_secs())
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| {
                AppError::TaskQueue(format!("countdown out of range: {:?}", countdown))
            })?;
        let schedule_time = google_cloud_wkt::Timestamp::clamp(run_at.timestamp(), 0);

        let task = Task::default()
            .set_http_request(http_request)
            .set_schedule_time(schedule_time);

        client
            .create_task()
            .set_parent(queue_path)
            .set_task(task)
            .send()
            .await
            .map_err(|e| AppError::TaskQueue(format!("Cloud Tasks create error: {}", e)))?;

        tracing::debug!(
            endpoint = job.endpoint(),
            countdown_secs = countdown.as_secs(),
            "Queued task"
        );

        Ok(())
    }
}

/// A job waiting in the local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job: Job,
    pub countdown: Duration,
}

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct LocalQueue {
    sender: mpsc::UnboundedSender<ScheduledJob>,
}

impl LocalQueue {
    /// Create the queue and the receiving end to drain it with.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ScheduledJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn enqueue(&self, job: Job, countdown: Duration) -> Result<()> {
        self.sender
            .send(ScheduledJob { job, countdown })
            .map_err(|_| AppError::TaskQueue("local queue closed".to_string()))
    }
}

/// Run jobs from a [`LocalQueue`] until every sender is gone.
///
/// Each job sleeps out its countdown on its own task so a long delay does
/// not hold up the rest of the queue.
pub async fn run_local_worker(
    state: Arc<AppState>,
    mut receiver: mpsc::UnboundedReceiver<ScheduledJob>,
) {
    tracing::info!("Local task worker started");

    while let Some(scheduled) = receiver.recv().await {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(scheduled.countdown).await;
            let endpoint = scheduled.job.endpoint();
            match crate::services::worker::dispatch(&state, scheduled.job).await {
                Ok(outcome) => tracing::debug!(endpoint, ?outcome, "Local task finished"),
                Err(e) => tracing::error!(endpoint, error = %e, "Local task failed"),
            }
        });
    }

    tracing::info!("Local task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time_series_job() -> Job {
        Job::TimeSeries(TimeSeriesPayload {
            fitbit_user: "ABC".to_string(),
            category: Category::Activities,
            resource: "steps".to_string(),
            date: NaiveDate::from_ymd_opt(2013, 5, 2),
            retries: 0,
        })
    }

    #[test]
    fn endpoints() {
        assert_eq!(time_series_job().endpoint(), "/tasks/time-series");
        let job = Job::Subscribe(SubscribePayload {
            fitbit_user: "ABC".into(),
            subscriber_id: "1".into(),
        });
        assert_eq!(job.endpoint(), "/tasks/subscribe");
    }

    #[test]
    fn task_body_is_bare_payload() {
        let body: serde_json::Value =
            serde_json::from_slice(&time_series_job().body().unwrap()).unwrap();
        assert_eq!(body["fitbit_user"], "ABC");
        assert_eq!(body["category"], "activities");
        assert_eq!(body["date"], "2013-05-02");
        assert!(body.get("kind").is_none());
    }

    #[test]
    fn retries_default_to_zero() {
        let payload: TimeSeriesPayload = serde_json::from_str(
            r#"{"fitbit_user":"ABC","category":"body","resource":"weight"}"#,
        )
        .unwrap();
        assert_eq!(payload.retries, 0);
        assert_eq!(payload.date, None);
    }

    #[tokio::test]
    async fn local_queue_delivers_in_order() {
        let (queue, mut rx) = LocalQueue::new();
        queue
            .enqueue(time_series_job(), Duration::from_secs(5))
            .await
            .unwrap();

        let scheduled = rx.recv().await.unwrap();
        assert_eq!(scheduled.job, time_series_job());
        assert_eq!(scheduled.countdown, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn closed_local_queue_is_an_error() {
        let (queue, rx) = LocalQueue::new();
        drop(rx);
        let err = queue
            .enqueue(time_series_job(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TaskQueue(_)));
    }
}
