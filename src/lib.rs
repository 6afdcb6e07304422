// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! fitlink: Fitbit account linking and time-series sync.
//!
//! This crate provides the HTTP views a host application mounts to let its
//! users link a Fitbit account, the webhook Fitbit pushes change
//! notifications to, and the background jobs that pull daily time series
//! into local storage.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::Store;
use services::{FitbitClient, GoogleOidcVerifier, LockCache, TaskQueue};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub fitbit: FitbitClient,
    pub queue: Arc<dyn TaskQueue>,
    /// Checks the tokens Cloud Tasks signs task requests with
    pub google_oidc_verifier: GoogleOidcVerifier,
    /// Fetch locks shared by every worker in this process
    pub locks: LockCache,
}
