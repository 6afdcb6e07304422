// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! fitlink server and operational commands.

use anyhow::Context;
use clap::{Parser, Subcommand};
use fitlink::{
    config::{Config, QueueBackend, StorageBackend},
    db::{FirestoreDb, MemoryStore, Store},
    services::{
        refresh::{refresh_tokens, RefreshOptions},
        tasks::run_local_worker,
        CloudTasksQueue, FitbitClient, GoogleOidcVerifier, LocalQueue, LockCache, TaskQueue,
    },
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fitlink")]
#[command(about = "Fitbit account linking and time-series sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,

    /// Refresh stored access tokens
    ///
    /// Without flags only expired tokens are refreshed.
    RefreshTokens {
        /// Refresh all tokens, not just the expired ones
        #[arg(long)]
        all: bool,

        /// Remove the link when Fitbit rejects its refresh token
        #[arg(long)]
        deauth: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging for GCP
    init_logging();

    let cli = Cli::parse();

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;

    let store = build_store(&config).await?;
    let fitbit = FitbitClient::new(
        config.fitbit_client_id.clone(),
        config.fitbit_client_secret.clone(),
    );

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store, fitbit).await,
        Command::RefreshTokens { all, deauth } => {
            let options = RefreshOptions { all, deauth };
            let summary =
                refresh_tokens(store.as_ref(), &fitbit, options, chrono::Utc::now()).await?;
            for line in summary.report(options) {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    Ok(match config.storage_backend {
        StorageBackend::Firestore => Arc::new(
            FirestoreDb::new(&config.gcp_project_id)
                .await
                .context("Failed to connect to Firestore")?,
        ),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn serve(config: Config, store: Arc<dyn Store>, fitbit: FitbitClient) -> anyhow::Result<()> {
    tracing::info!(port = config.port, subscribe = config.subscribe, "Starting fitlink");

    let (queue, local_receiver) = match config.task_queue {
        QueueBackend::CloudTasks => {
            tracing::info!(project = %config.gcp_project_id, "Using Cloud Tasks queue");
            let queue: Arc<dyn TaskQueue> = Arc::new(CloudTasksQueue::new(
                &config.gcp_project_id,
                &config.gcp_region,
                &config.api_url,
                &config.tasks_service_account,
            ));
            (queue, None)
        }
        QueueBackend::Local => {
            tracing::info!("Using in-process task queue");
            let (queue, receiver) = LocalQueue::new();
            let queue: Arc<dyn TaskQueue> = Arc::new(queue);
            (queue, Some(receiver))
        }
    };

    let google_oidc_verifier =
        GoogleOidcVerifier::new(&config).context("Failed to initialize tasks OIDC verifier")?;

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        fitbit,
        queue,
        google_oidc_verifier,
        locks: LockCache::new(),
    });

    if let Some(receiver) = local_receiver {
        tokio::spawn(run_local_worker(Arc::clone(&state), receiver));
    }

    let app = fitlink::routes::create_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fitlink=debug,info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();
}
