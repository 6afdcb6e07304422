// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod fitbit;
pub mod google_oidc;
pub mod lock;
pub mod refresh;
pub mod tasks;
pub mod worker;

pub use fitbit::{FitbitClient, FitbitError, FitbitSession};
pub use google_oidc::{GoogleOidcVerifier, OidcError, TaskPrincipal};
pub use lock::LockCache;
pub use tasks::{CloudTasksQueue, Job, LocalQueue, TaskQueue};
pub use worker::TaskOutcome;
