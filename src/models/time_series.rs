// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Time-series data points and the date ranges used to query them.

use crate::time_utils::{format_date, parse_date};
use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stored value for (user, resource type, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub user_id: u64,
    pub resource_type_id: u32,
    pub date: NaiveDate,
    /// Raw value as reported by Fitbit; kept as a string since units vary
    pub value: Option<String>,
}

impl TimeSeriesPoint {
    /// Document ID, unique per (user, resource type, date).
    pub fn doc_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.user_id,
            self.resource_type_id,
            format_date(self.date)
        )
    }
}

/// One element of a Fitbit time-series response, also used as the data
/// view's output object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesEntry {
    #[serde(rename = "dateTime")]
    pub date_time: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub value: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Fixed periods accepted by the Fitbit time-series endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    OneDay,
    SevenDays,
    ThirtyDays,
    OneWeek,
    OneMonth,
    ThreeMonths,
    SixMonths,
    OneYear,
    Max,
}

impl Period {
    pub const ALL: [Period; 9] = [
        Period::OneDay,
        Period::SevenDays,
        Period::ThirtyDays,
        Period::OneWeek,
        Period::OneMonth,
        Period::ThreeMonths,
        Period::SixMonths,
        Period::OneYear,
        Period::Max,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::OneDay => "1d",
            Period::SevenDays => "7d",
            Period::ThirtyDays => "30d",
            Period::OneWeek => "1w",
            Period::OneMonth => "1m",
            Period::ThreeMonths => "3m",
            Period::SixMonths => "6m",
            Period::OneYear => "1y",
            Period::Max => "max",
        }
    }

    /// Last date covered when the period starts at `base`. `None` for `max`.
    pub fn end_from(&self, base: NaiveDate) -> Option<NaiveDate> {
        match self {
            Period::OneDay => base.checked_add_days(Days::new(1)),
            Period::SevenDays => base.checked_add_days(Days::new(7)),
            Period::ThirtyDays => base.checked_add_days(Days::new(30)),
            Period::OneWeek => base.checked_add_days(Days::new(7)),
            Period::OneMonth => base.checked_add_months(Months::new(1)),
            Period::ThreeMonths => base.checked_add_months(Months::new(3)),
            Period::SixMonths => base.checked_add_months(Months::new(6)),
            Period::OneYear => base.checked_add_months(Months::new(12)),
            Period::Max => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = InvalidQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| InvalidQuery(format!("invalid period: {s}")))
    }
}

/// Rejected time-series query parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidQuery(pub String);

/// Start of a query: a concrete date, or whatever "today" is for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseDate {
    Today,
    Date(NaiveDate),
}

impl BaseDate {
    fn api_segment(&self) -> String {
        match self {
            BaseDate::Today => "today".to_string(),
            BaseDate::Date(d) => format_date(*d),
        }
    }

    fn resolve(&self, today: NaiveDate) -> NaiveDate {
        match self {
            BaseDate::Today => today,
            BaseDate::Date(d) => *d,
        }
    }
}

/// Either a period starting at a base date, or an explicit date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSeriesQuery {
    Period { base: BaseDate, period: Period },
    Range { base: NaiveDate, end: NaiveDate },
}

impl TimeSeriesQuery {
    /// Build a query from the data view's `base_date`, `end_date` and
    /// `period` parameters. Exactly one of `period` and `end_date` must be
    /// given; `base_date` is required with `end_date` and defaults to today
    /// with `period`.
    pub fn from_params(
        base_date: Option<&str>,
        end_date: Option<&str>,
        period: Option<&str>,
    ) -> Result<Self, InvalidQuery> {
        let base = base_date
            .map(|raw| {
                parse_date(raw).ok_or_else(|| InvalidQuery(format!("invalid base_date: {raw}")))
            })
            .transpose()?;

        match (period, end_date) {
            (Some(_), Some(_)) => Err(InvalidQuery(
                "period and end_date are mutually exclusive".to_string(),
            )),
            (None, None) => Err(InvalidQuery(
                "one of period or end_date is required".to_string(),
            )),
            (Some(period), None) => Ok(TimeSeriesQuery::Period {
                base: base.map(BaseDate::Date).unwrap_or(BaseDate::Today),
                period: period.parse()?,
            }),
            (None, Some(end_raw)) => {
                let base = base.ok_or_else(|| {
                    InvalidQuery("base_date is required with end_date".to_string())
                })?;
                let end = parse_date(end_raw)
                    .ok_or_else(|| InvalidQuery(format!("invalid end_date: {end_raw}")))?;
                Ok(TimeSeriesQuery::Range { base, end })
            }
        }
    }

    /// A single day.
    pub fn day(date: NaiveDate) -> Self {
        TimeSeriesQuery::Range {
            base: date,
            end: date,
        }
    }

    /// All data up to today.
    pub fn all_time() -> Self {
        TimeSeriesQuery::Period {
            base: BaseDate::Today,
            period: Period::Max,
        }
    }

    /// `{base}/{end|period}` segments of the API URL.
    pub fn api_segments(&self) -> String {
        match self {
            TimeSeriesQuery::Period { base, period } => {
                format!("{}/{}", base.api_segment(), period)
            }
            TimeSeriesQuery::Range { base, end } => {
                format!("{}/{}", format_date(*base), format_date(*end))
            }
        }
    }

    /// Inclusive date bounds used when reading from the local store.
    pub fn local_range(&self, today: NaiveDate) -> DateRange {
        match self {
            TimeSeriesQuery::Period { base, period } => {
                let from = base.resolve(today);
                DateRange {
                    from: Some(from),
                    to: period.end_from(from),
                }
            }
            TimeSeriesQuery::Range { base, end } => DateRange {
                from: Some(*base),
                to: Some(*end),
            },
        }
    }
}

/// Inclusive bounds; `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
    }
}
