// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Catalog of Fitbit time-series resources.
//!
//! Static reference data compiled into the binary. IDs are stable and are
//! what time-series rows refer to, so entries may be appended but never
//! renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fitbit time-series category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Foods = 0,
    Activities = 1,
    Sleep = 2,
    Body = 3,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Foods,
        Category::Activities,
        Category::Sleep,
        Category::Body,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Foods => "foods",
            Category::Activities => "activities",
            Category::Sleep => "sleep",
            Category::Body => "body",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// One queryable Fitbit time-series resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceType {
    pub id: u32,
    pub category: Category,
    /// The `[resource-path]` part of the API URL, e.g. `steps` or `tracker/steps`
    pub resource: &'static str,
}

impl ResourceType {
    /// Path used in API URLs, e.g. `activities/steps`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.category, self.resource)
    }

    /// Key under which the API returns the series, e.g. `activities-steps`.
    pub fn response_key(&self) -> String {
        self.path().replace('/', "-")
    }

    /// Resources for which a 400 just means the user's device has no such data.
    pub fn missing_data_is_bad_request(&self) -> bool {
        self.resource.contains("elevation") || self.resource.contains("floors")
    }

    pub fn all() -> &'static [ResourceType] {
        CATALOG
    }

    pub fn find(category: Category, resource: &str) -> Option<&'static ResourceType> {
        CATALOG
            .iter()
            .find(|rt| rt.category == category && rt.resource == resource)
    }

    pub fn in_category(category: Category) -> impl Iterator<Item = &'static ResourceType> {
        CATALOG.iter().filter(move |rt| rt.category == category)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.resource)
    }
}

const fn rt(id: u32, category: Category, resource: &'static str) -> ResourceType {
    ResourceType {
        id,
        category,
        resource,
    }
}

static CATALOG: &[ResourceType] = &[
    rt(1, Category::Foods, "log/caloriesIn"),
    rt(2, Category::Foods, "log/water"),
    rt(3, Category::Activities, "calories"),
    rt(4, Category::Activities, "caloriesBMR"),
    rt(5, Category::Activities, "steps"),
    rt(6, Category::Activities, "distance"),
    rt(7, Category::Activities, "floors"),
    rt(8, Category::Activities, "elevation"),
    rt(9, Category::Activities, "minutesSedentary"),
    rt(10, Category::Activities, "minutesLightlyActive"),
    rt(11, Category::Activities, "minutesFairlyActive"),
    rt(12, Category::Activities, "minutesVeryActive"),
    rt(13, Category::Activities, "activityCalories"),
    rt(14, Category::Activities, "tracker/calories"),
    rt(15, Category::Activities, "tracker/steps"),
    rt(16, Category::Activities, "tracker/distance"),
    rt(17, Category::Activities, "tracker/floors"),
    rt(18, Category::Activities, "tracker/elevation"),
    rt(19, Category::Activities, "tracker/minutesSedentary"),
    rt(20, Category::Activities, "tracker/minutesLightlyActive"),
    rt(21, Category::Activities, "tracker/minutesFairlyActive"),
    rt(22, Category::Activities, "tracker/minutesVeryActive"),
    rt(23, Category::Activities, "tracker/activityCalories"),
    rt(24, Category::Sleep, "startTime"),
    rt(25, Category::Sleep, "timeInBed"),
    rt(26, Category::Sleep, "minutesAsleep"),
    rt(27, Category::Sleep, "awakeningsCount"),
    rt(28, Category::Sleep, "minutesAwake"),
    rt(29, Category::Sleep, "minutesToFallAsleep"),
    rt(30, Category::Sleep, "minutesAfterWakeup"),
    rt(31, Category::Sleep, "efficiency"),
    rt(32, Category::Body, "weight"),
    rt(33, Category::Body, "bmi"),
    rt(34, Category::Body, "fat"),
];
