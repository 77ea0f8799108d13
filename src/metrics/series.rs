//! Date-bucketed series for chart consumers.

use crate::error::{Error, Result};
use crate::metrics::service::{MetricsService, SERIES_CACHE_PREFIX, non_negative};
use crate::metrics::{Granularity, MetricsSeries};

use chrono::{Days, NaiveDate};
use hex::ToHex as _;
use sha2::{Digest as _, Sha256};

/// Calendar days covered when the caller omits `start`, `end` included.
const DEFAULT_WINDOW_DAYS: u64 = 7;

impl MetricsService {
    /// Per-bucket totals across all pages between `start` and `end`
    /// (inclusive calendar dates), ascending by bucket.
    ///
    /// Buckets with no rows are absent rather than zero-filled. A missing
    /// `end` means today; a missing `start` means six days before `end`.
    /// Dates too close to the calendar limits to form a window are rejected.
    pub async fn get_metrics_by_date_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        granularity: Granularity,
        force_refresh: bool,
    ) -> Result<MetricsSeries> {
        let end = end.unwrap_or_else(|| self.clock.now().date_naive());
        let start = match start {
            Some(start) => start,
            None => end
                .checked_sub_days(Days::new(DEFAULT_WINDOW_DAYS - 1))
                .ok_or_else(|| {
                    Error::Validation(format!("no default window fits before {end}"))
                })?,
        };
        if start > end {
            return Err(Error::Validation(format!(
                "start date {start} is after end date {end}"
            )));
        }

        let key = series_cache_key(start, end, granularity);
        if !force_refresh && let Some(series) = self.series_cache.get(&key) {
            return Ok(series);
        }

        let from = format!("{start} 00:00:00");
        let next_day = end
            .checked_add_days(Days::new(1))
            .ok_or_else(|| Error::Validation(format!("end date {end} is out of range")))?;
        let until = format!("{next_day} 00:00:00");
        let rows = self.store.series_rows(&from, &until, granularity).await?;

        let mut series = MetricsSeries::default();
        for row in rows {
            series.dates.push(row.bucket_key);
            series.carbon_footprint.push(non_negative(row.carbon_footprint));
            series.energy_consumption.push(non_negative(row.energy_consumption));
            series.data_transfer.push(non_negative(row.total_bytes) / 1024.0);
            series.http_requests.push(row.requests.max(0));
            series.page_views.push(row.views.max(0));
            series.avg_load_time.push(non_negative(row.avg_load_time));
        }

        tracing::debug!(%start, %end, %granularity, buckets = series.len(), "computed metrics series");

        self.series_cache.insert(
            key,
            series.clone(),
            chrono::Duration::seconds(self.settings.series_cache_ttl_secs as i64),
        );
        Ok(series)
    }
}

/// Stable, fixed-length cache key for a series query.
fn series_cache_key(start: NaiveDate, end: NaiveDate, granularity: Granularity) -> String {
    let digest = Sha256::digest(format!("{start}|{end}|{granularity}").as_bytes());
    format!("{SERIES_CACHE_PREFIX}{}", digest.encode_hex::<String>())
}
