//! Page-view carbon and performance metrics engine.
//!
//! Records page views, derives energy, carbon, and performance figures,
//! serves cached aggregates and chart series, and rolls old raw data into
//! calendar-bucketed summaries before pruning it.

pub mod calculator;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod schema;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use db::Db;
pub use error::{Error, Result};
pub use maintenance::{
    AggregationReport, MaintenancePhase, MaintenanceReport, RetentionManager,
    spawn_maintenance_loop,
};
pub use metrics::{
    AggregatedPeriodRecord, Granularity, MetricsSeries, MetricsService, PageStats, PageView,
    Scope,
};
