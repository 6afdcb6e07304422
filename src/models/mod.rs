// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod account;
pub mod resource_type;
pub mod time_series;

pub use account::{AccountLink, OAuthToken};
pub use resource_type::{Category, ResourceType};
pub use time_series::{
    BaseDate, DateRange, InvalidQuery, Period, TimeSeriesEntry, TimeSeriesPoint, TimeSeriesQuery,
};
