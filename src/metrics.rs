//! Metrics lifecycle: ingestion, cached aggregates, and date-bucketed series.

pub mod bucket;
pub(crate) mod cache;
pub mod series;
pub mod service;
pub mod store;
pub mod types;

pub use bucket::{bucket_bounds, bucket_start};
pub use service::MetricsService;
pub use store::MetricsStore;
pub use types::{
    AggregatedPeriodRecord, Granularity, MetricsSeries, PageStats, PageView, RawMetricRecord,
    Scope,
};
