//! Metrics engine types.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

/// Calendar bucketing unit for charts and rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[serde(alias = "day")]
    Daily,
    #[serde(alias = "week")]
    Weekly,
    #[serde(alias = "month")]
    Monthly,
}

impl Granularity {
    pub const ALL: &'static [Granularity] =
        &[Granularity::Daily, Granularity::Weekly, Granularity::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Daily),
            "week" | "weekly" => Ok(Granularity::Weekly),
            "month" | "monthly" => Ok(Granularity::Monthly),
            other => Err(format!("unknown granularity: {other}")),
        }
    }
}

/// Cache and query partition: one page, or every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Page(i64),
    All,
}

impl Scope {
    pub fn page_id(&self) -> Option<i64> {
        match self {
            Scope::Page(page_id) => Some(*page_id),
            Scope::All => None,
        }
    }

    pub(crate) fn cache_key(&self) -> String {
        match self {
            Scope::Page(page_id) => format!("stats:page:{page_id}"),
            Scope::All => "stats:all".to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Page(page_id) => write!(f, "page {page_id}"),
            Scope::All => f.write_str("all pages"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Scope::All);
        }
        s.parse::<i64>()
            .map(Scope::Page)
            .map_err(|_| format!("scope must be a page id or 'all', got {s:?}"))
    }
}

/// One page view as reported by the client, before derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageView {
    pub page_id: i64,
    /// Bytes transferred.
    pub data_transfer: i64,
    /// Seconds.
    pub load_time: f64,
    pub requests: i64,
}

impl PageView {
    pub fn validate(&self) -> Result<()> {
        if self.page_id <= 0 {
            return Err(Error::Validation(format!(
                "page_id must be positive, got {}",
                self.page_id
            )));
        }
        if self.data_transfer < 0 {
            return Err(Error::Validation(format!(
                "data_transfer must not be negative, got {}",
                self.data_transfer
            )));
        }
        if !self.load_time.is_finite() || self.load_time < 0.0 {
            return Err(Error::Validation(format!(
                "load_time must be a finite, non-negative number of seconds, got {}",
                self.load_time
            )));
        }
        if self.requests < 0 {
            return Err(Error::Validation(format!(
                "requests must not be negative, got {}",
                self.requests
            )));
        }
        Ok(())
    }
}

/// A stored page-view observation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct RawMetricRecord {
    pub id: i64,
    pub page_id: i64,
    pub data_transfer: i64,
    pub load_time: f64,
    pub requests: i64,
    pub carbon_footprint: f64,
    pub energy_consumption: f64,
    pub performance_score: f64,
    pub created_at: String,
}

/// A rollup of one page over one calendar bucket.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AggregatedPeriodRecord {
    pub id: i64,
    pub page_id: i64,
    pub period_start: String,
    /// Inclusive end of the bucket.
    pub period_end: String,
    pub granularity: String,
    pub views: i64,
    pub total_data_transfer: i64,
    pub avg_data_transfer: f64,
    pub total_load_time: f64,
    pub avg_load_time: f64,
    pub total_requests: i64,
    pub avg_requests: f64,
    pub total_carbon_footprint: f64,
    pub avg_carbon_footprint: f64,
    pub total_energy_consumption: f64,
    pub avg_energy_consumption: f64,
    pub avg_performance_score: f64,
    /// Raw rows in the bucket created before this instant were summed.
    pub covered_until: String,
    pub created_at: String,
}

/// Aggregate figures for a scope, as served to presentation collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStats {
    pub total_views: i64,
    /// Bytes.
    pub total_data_transfer: i64,
    pub avg_load_time: f64,
    /// Falls back to `avg_load_time` when no rows exist.
    pub median_load_time: f64,
    pub total_requests: i64,
    pub avg_performance_score: f64,
    /// kWh.
    pub total_energy_consumption: f64,
    /// Grams CO2e.
    pub total_carbon_footprint: f64,
}

impl Default for PageStats {
    fn default() -> Self {
        Self {
            total_views: 0,
            total_data_transfer: 0,
            avg_load_time: 0.0,
            median_load_time: 0.0,
            total_requests: 0,
            avg_performance_score: 100.0,
            total_energy_consumption: 0.0,
            total_carbon_footprint: 0.0,
        }
    }
}

/// Date-bucketed series shaped for chart consumers: one label sequence and
/// one value sequence per metric, all the same length, ascending by bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSeries {
    pub dates: Vec<String>,
    pub carbon_footprint: Vec<f64>,
    pub energy_consumption: Vec<f64>,
    /// Kilobytes.
    pub data_transfer: Vec<f64>,
    pub http_requests: Vec<i64>,
    pub page_views: Vec<i64>,
    pub avg_load_time: Vec<f64>,
}

impl MetricsSeries {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}
