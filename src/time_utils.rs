// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date formatting and parsing.

use chrono::NaiveDate;

/// Date format used by the Fitbit API and by the query string.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` date, rejecting anything else.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Format a date as `YYYY-MM-DD`.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso_dates_only() {
        assert_eq!(
            parse_date("2013-05-02"),
            NaiveDate::from_ymd_opt(2013, 5, 2)
        );
        assert_eq!(parse_date("bad"), None);
        assert_eq!(parse_date("05/02/2013"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn formats_with_zero_padding() {
        let date = NaiveDate::from_ymd_opt(2012, 6, 7).unwrap();
        assert_eq!(format_date(date), "2012-06-07");
    }
}
