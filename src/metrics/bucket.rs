//! Calendar bucketing shared by the series engine and the rollup job.
//!
//! A bucket is identified by its start date: the day itself, the ISO Monday
//! of its week, or the first of its month. SQLite computes the key while
//! grouping; Rust computes the bounds when a rollup needs them. The two
//! rules must agree, which the tests below pin down.

use crate::metrics::Granularity;

use chrono::{Datelike as _, Days, Months, NaiveDate, NaiveDateTime, NaiveTime};

/// SQL expression mapping `created_at` to its bucket start date
/// (`YYYY-MM-DD`). Only these fixed fragments are ever spliced into SQL.
pub(crate) fn bucket_sql(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Daily => "date(created_at)",
        Granularity::Weekly => {
            "date(created_at, '-' || ((CAST(strftime('%w', created_at) AS INTEGER) + 6) % 7) || ' days')"
        }
        Granularity::Monthly => "strftime('%Y-%m-01', created_at)",
    }
}

/// Start date of the bucket containing `date`.
pub fn bucket_start(date: NaiveDate, granularity: Granularity) -> NaiveDate {
    match granularity {
        Granularity::Daily => date,
        Granularity::Weekly => {
            date - Days::new(u64::from(date.weekday().num_days_from_monday()))
        }
        Granularity::Monthly => date.with_day(1).unwrap_or(date),
    }
}

/// First and last instant (inclusive, second precision) of the bucket that
/// starts on `start`.
pub fn bucket_bounds(start: NaiveDate, granularity: Granularity) -> (NaiveDateTime, NaiveDateTime) {
    let start = bucket_start(start, granularity);
    let next = match granularity {
        Granularity::Daily => start + Days::new(1),
        Granularity::Weekly => start + Days::new(7),
        Granularity::Monthly => start + Months::new(1),
    };
    let end = next.and_time(NaiveTime::MIN) - chrono::Duration::seconds(1);
    (start.and_time(NaiveTime::MIN), end)
}

/// Parse a bucket key produced by [`bucket_sql`].
pub(crate) fn parse_bucket_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}
