// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore-backed [`Store`].
//!
//! Collections:
//! - `account_links/{user_id}`: tokens for a linked user
//! - `fitbit_users/{fitbit_user}`: uniqueness index back to the local user
//! - `time_series/{user_id}_{resource_type_id}_{date}`: one data point

use crate::db::{collections, Store};
use crate::error::AppError;
use crate::models::{AccountLink, DateRange, OAuthToken, TimeSeriesPoint};
use crate::time_utils::format_date;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use firestore::errors::{BackoffError, FirestoreError};
use firestore::FirestoreTransaction;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};

const MAX_CONCURRENT_DB_OPS: usize = 50;

/// Entry in the `fitbit_users` index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FitbitUserIndex {
    user_id: u64,
}

/// Result of the link transaction.
enum LinkOutcome {
    Linked,
    AlreadyLinked,
}

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: firestore::FirestoreDb,
}

impl FirestoreDb {
    /// Connect to Firestore.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, AppError> {
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self { client })
    }

    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJmaXRsaW5rIn0."
                        .to_string()
                        .into(),
                ),
                expiry: Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(project = project_id, "Connected to Firestore Emulator");

        Ok(Self { client })
    }

    async fn get_index(&self, fitbit_user: &str) -> Result<Option<FitbitUserIndex>, AppError> {
        self.client
            .fluent()
            .select()
            .by_id_in(collections::FITBIT_USERS)
            .obj()
            .one(fitbit_user)
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

#[async_trait]
impl Store for FirestoreDb {
    async fn get_link(&self, user_id: u64) -> Result<Option<AccountLink>, AppError> {
        self.client
            .fluent()
            .select()
            .by_id_in(collections::ACCOUNT_LINKS)
            .obj()
            .one(&user_id.to_string())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn get_link_by_fitbit_user(
        &self,
        fitbit_user: &str,
    ) -> Result<Option<AccountLink>, AppError> {
        let Some(index) = self.get_index(fitbit_user).await? else {
            return Ok(None);
        };

        // The index may briefly outlive a relinked account; trust the link.
        Ok(self
            .get_link(index.user_id)
            .await?
            .filter(|link| link.fitbit_user == fitbit_user))
    }

    async fn list_links(&self) -> Result<Vec<AccountLink>, AppError> {
        self.client
            .fluent()
            .select()
            .from(collections::ACCOUNT_LINKS)
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    async fn link_account(&self, link: &AccountLink) -> Result<(), AppError> {
        let new_link = link.clone();

        let outcome = self
            .client
            .run_transaction(move |db, transaction| {
                Box::pin(link_in_transaction(db, transaction, new_link.clone()))
            })
            .await
            .map_err(|e| AppError::Database(format!("Link transaction failed: {}", e)))?;

        match outcome {
            LinkOutcome::AlreadyLinked => Err(AppError::AlreadyLinked(link.fitbit_user.clone())),
            LinkOutcome::Linked => {
                tracing::info!(
                    user_id = link.user_id,
                    fitbit_user = %link.fitbit_user,
                    "Account linked"
                );
                Ok(())
            }
        }
    }

    async fn delete_link(&self, user_id: u64) -> Result<Option<AccountLink>, AppError> {
        let deleted = self
            .client
            .run_transaction(move |db, transaction| {
                Box::pin(unlink_in_transaction(db, transaction, user_id))
            })
            .await
            .map_err(|e| AppError::Database(format!("Unlink transaction failed: {}", e)))?;

        if let Some(link) = &deleted {
            tracing::info!(user_id, fitbit_user = %link.fitbit_user, "Account link deleted");
        }

        Ok(deleted)
    }

    async fn save_token_if_newer(
        &self,
        user_id: u64,
        token: &OAuthToken,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let new_token = token.clone();

        self.client
            .run_transaction(move |db, transaction| {
                Box::pin(save_token_in_transaction(
                    db,
                    transaction,
                    user_id,
                    new_token.clone(),
                    now,
                ))
            })
            .await
            .map_err(|e| AppError::Database(format!("Token transaction failed: {}", e)))
    }

    async fn upsert_time_series(&self, points: &[TimeSeriesPoint]) -> Result<(), AppError> {
        let client = self.client.clone();

        stream::iter(points.to_vec())
            .map(|point| {
                let client = client.clone();
                async move {
                    let _: () = client
                        .fluent()
                        .update()
                        .in_col(collections::TIME_SERIES)
                        .document_id(point.doc_id())
                        .object(&point)
                        .execute()
                        .await
                        .map_err(|e| AppError::Database(e.to_string()))?;

                    Ok::<_, AppError>(())
                }
            })
            .buffer_unordered(MAX_CONCURRENT_DB_OPS)
            .collect::<Vec<Result<(), AppError>>>()
            .await
            .into_iter()
            .collect::<Result<Vec<()>, AppError>>()?;

        Ok(())
    }

    async fn get_time_series(
        &self,
        user_id: u64,
        resource_type_id: u32,
        range: &DateRange,
    ) -> Result<Vec<TimeSeriesPoint>, AppError> {
        let from = range.from.map(format_date);
        let to = range.to.map(format_date);

        self.client
            .fluent()
            .select()
            .from(collections::TIME_SERIES)
            .filter(move |q| {
                q.for_all([
                    q.field("user_id").eq(user_id),
                    q.field("resource_type_id").eq(u64::from(resource_type_id)),
                    from.clone()
                        .and_then(|d| q.field("date").greater_than_or_equal(d)),
                    to.clone().and_then(|d| q.field("date").less_than_or_equal(d)),
                ])
            })
            .order_by([("date", firestore::FirestoreQueryDirection::Ascending)])
            .obj()
            .query()
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }
}

// Transaction bodies. Every read goes through `db`, which the transaction
// runner binds to the open transaction, so a concurrent write to a document
// read here aborts and reruns the body.

type TxResult<T> = std::result::Result<T, BackoffError<FirestoreError>>;

async fn read_link(db: &firestore::FirestoreDb, user_id: u64) -> TxResult<Option<AccountLink>> {
    Ok(db
        .fluent()
        .select()
        .by_id_in(collections::ACCOUNT_LINKS)
        .obj()
        .one(&user_id.to_string())
        .await?)
}

async fn link_in_transaction(
    db: firestore::FirestoreDb,
    transaction: &mut FirestoreTransaction<'_>,
    link: AccountLink,
) -> TxResult<LinkOutcome> {
    let index: Option<FitbitUserIndex> = db
        .fluent()
        .select()
        .by_id_in(collections::FITBIT_USERS)
        .obj()
        .one(&link.fitbit_user)
        .await?;
    if index.is_some_and(|index| index.user_id != link.user_id) {
        return Ok(LinkOutcome::AlreadyLinked);
    }

    // Relinking to a different Fitbit account releases the old one.
    if let Some(previous) = read_link(&db, link.user_id).await? {
        if previous.fitbit_user != link.fitbit_user {
            db.fluent()
                .delete()
                .from(collections::FITBIT_USERS)
                .document_id(&previous.fitbit_user)
                .add_to_transaction(transaction)?;
        }
    }

    db.fluent()
        .update()
        .in_col(collections::ACCOUNT_LINKS)
        .document_id(link.user_id.to_string())
        .object(&link)
        .add_to_transaction(transaction)?;

    db.fluent()
        .update()
        .in_col(collections::FITBIT_USERS)
        .document_id(&link.fitbit_user)
        .object(&FitbitUserIndex {
            user_id: link.user_id,
        })
        .add_to_transaction(transaction)?;

    Ok(LinkOutcome::Linked)
}

async fn unlink_in_transaction(
    db: firestore::FirestoreDb,
    transaction: &mut FirestoreTransaction<'_>,
    user_id: u64,
) -> TxResult<Option<AccountLink>> {
    let Some(link) = read_link(&db, user_id).await? else {
        return Ok(None);
    };

    db.fluent()
        .delete()
        .from(collections::ACCOUNT_LINKS)
        .document_id(user_id.to_string())
        .add_to_transaction(transaction)?;

    db.fluent()
        .delete()
        .from(collections::FITBIT_USERS)
        .document_id(&link.fitbit_user)
        .add_to_transaction(transaction)?;

    Ok(Some(link))
}

async fn save_token_in_transaction(
    db: firestore::FirestoreDb,
    transaction: &mut FirestoreTransaction<'_>,
    user_id: u64,
    token: OAuthToken,
    now: DateTime<Utc>,
) -> TxResult<bool> {
    let Some(mut link) = read_link(&db, user_id).await? else {
        return Ok(false);
    };

    if !link.accepts_token(&token, now) {
        tracing::debug!(
            user_id,
            stored_expiry = %link.expires_at,
            new_expiry = %token.expires_at,
            "Discarding stale refreshed token"
        );
        return Ok(false);
    }

    link.apply_token(&token);

    db.fluent()
        .update()
        .in_col(collections::ACCOUNT_LINKS)
        .document_id(user_id.to_string())
        .object(&link)
        .add_to_transaction(transaction)?;

    Ok(true)
}
