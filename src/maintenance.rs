//! Aggregation and retention: roll raw rows into calendar buckets, then prune.
//!
//! Only closed buckets are rolled up: the aggregation cutoff is floored to the
//! start of the bucket containing it, so a rollup always summarises its whole
//! bucket and a bucket still receiving rows waits for a later run.
//!
//! Both phases are safe to re-run. Aggregation skips any bucket that already
//! has a rollup and inserts with a uniqueness guard; pruning is a bounded bulk
//! delete that, with `require_aggregation_before_pruning`, only touches raw
//! rows a rollup summed (`covered_until`).

use crate::calculator::{compute_performance_score, sanitize_score};
use crate::clock::{TIMESTAMP_FORMAT, format_timestamp};
use crate::error::{Error, Result};
use crate::metrics::bucket::parse_bucket_key;
use crate::metrics::store::NewAggregate;
use crate::metrics::{Granularity, MetricsService, bucket_bounds};

use anyhow::Context as _;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use std::sync::{Arc, Mutex};

const LAST_RUN_STATE_KEY: &str = "maintenance.last_run";

/// Where a maintenance run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenancePhase {
    Idle,
    Aggregating,
    Pruning,
}

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    /// Rollups inserted by this pass.
    pub aggregated: u64,
    /// Buckets found already rolled up or emptied underneath us.
    pub skipped: u64,
    /// One entry per bucket that failed. The rest of the pass still ran.
    pub errors: Vec<String>,
}

/// Outcome of one scheduled run, persisted for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub aggregated_count: u64,
    pub pruned_count: u64,
    pub error_flag: bool,
    pub errors: Vec<String>,
    /// Another run was already active, so this trigger did nothing.
    pub skipped: bool,
}

pub struct RetentionManager {
    service: Arc<MetricsService>,
    phase: Mutex<MaintenancePhase>,
}

/// Resets the phase to idle when a run ends, including on early return.
struct PhaseGuard<'a> {
    phase: &'a Mutex<MaintenancePhase>,
}

impl PhaseGuard<'_> {
    fn set(&self, next: MaintenancePhase) {
        *self.phase.lock().expect("phase lock poisoned") = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = MaintenancePhase::Idle;
        }
    }
}

impl RetentionManager {
    pub fn new(service: Arc<MetricsService>) -> Self {
        Self {
            service,
            phase: Mutex::new(MaintenancePhase::Idle),
        }
    }

    pub fn phase(&self) -> MaintenancePhase {
        *self.phase.lock().expect("phase lock poisoned")
    }

    /// Roll raw rows older than `days_old` days into one record per
    /// (page, bucket) that does not have one yet. A bucket that ends after
    /// the cutoff is left for a later run.
    ///
    /// Enumeration is capped at `max_aggregation_tuples`; a later run picks
    /// up the remainder. Per-bucket failures land in the report.
    pub async fn aggregate_old_data(
        &self,
        days_old: u32,
        granularity: Granularity,
    ) -> Result<AggregationReport> {
        let settings = self.service.settings();
        let now = self.service.clock().now();
        let cutoff = (now - Duration::days(i64::from(days_old))).naive_utc();
        let (boundary, _) = bucket_bounds(cutoff.date(), granularity);
        let boundary_text = boundary.format(TIMESTAMP_FORMAT).to_string();
        let created_at = format_timestamp(now);

        let pending = self
            .service
            .store()
            .pending_buckets(
                &boundary_text,
                granularity,
                i64::from(settings.max_aggregation_tuples),
            )
            .await?;

        tracing::debug!(
            %granularity,
            boundary = %boundary_text,
            buckets = pending.len(),
            "aggregating old metrics"
        );

        let mut report = AggregationReport::default();
        for (page_id, bucket_key) in pending {
            let bucket_key = bucket_key.as_deref().unwrap_or("<invalid>");
            match self
                .aggregate_bucket(page_id, bucket_key, granularity, &created_at)
                .await
            {
                Ok(true) => report.aggregated += 1,
                Ok(false) => report.skipped += 1,
                Err(error) => {
                    tracing::warn!(%error, page_id, bucket = bucket_key, "failed to aggregate bucket");
                    report
                        .errors
                        .push(format!("page {page_id}, bucket {bucket_key}: {error}"));
                }
            }
        }

        tracing::info!(
            %granularity,
            aggregated = report.aggregated,
            skipped = report.skipped,
            errors = report.errors.len(),
            "aggregation pass finished"
        );
        Ok(report)
    }

    /// Delete raw rows older than `days_old` days, at most
    /// `prune_batch_limit` per call. Returns the number deleted.
    pub async fn prune_old_data(&self, days_old: u32) -> Result<u64> {
        let settings = self.service.settings();
        let cutoff = format_timestamp(self.service.clock().now() - Duration::days(i64::from(days_old)));
        let covered_by = settings
            .require_aggregation_before_pruning
            .then_some(settings.aggregation_granularity);

        let pruned = self
            .service
            .store()
            .prune_raw(&cutoff, covered_by, i64::from(settings.prune_batch_limit))
            .await?;

        tracing::info!(
            pruned,
            cutoff = %cutoff,
            require_aggregation = covered_by.is_some(),
            "pruned raw metrics"
        );
        Ok(pruned)
    }

    /// One full lifecycle pass: aggregate (when enabled), then prune (when a
    /// retention period is set). Never fails; problems are in the report.
    pub async fn run_scheduled_maintenance(&self) -> MaintenanceReport {
        let started_at = format_timestamp(self.service.clock().now());
        let mut report = MaintenanceReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            ..Default::default()
        };

        let Some(guard) = self.try_begin() else {
            tracing::info!(run_id = %report.run_id, "maintenance already running, skipping trigger");
            report.skipped = true;
            report.finished_at = report.started_at.clone();
            return report;
        };

        let settings = self.service.settings();

        if settings.aggregation_enabled {
            guard.set(MaintenancePhase::Aggregating);
            match self
                .aggregate_old_data(settings.aggregation_age_days, settings.aggregation_granularity)
                .await
            {
                Ok(aggregation) => {
                    report.aggregated_count = aggregation.aggregated;
                    report.errors.extend(aggregation.errors);
                }
                Err(error) => {
                    tracing::error!(%error, "aggregation phase failed");
                    report.errors.push(format!("aggregation: {error}"));
                }
            }
        }

        if settings.retention_period_days > 0 {
            guard.set(MaintenancePhase::Pruning);
            match self.prune_old_data(settings.retention_period_days).await {
                Ok(pruned) => report.pruned_count = pruned,
                Err(error) => {
                    tracing::error!(%error, "pruning phase failed");
                    report.errors.push(format!("pruning: {error}"));
                }
            }
        }

        if report.pruned_count > 0 {
            self.service.clear_cache();
        }
        self.service.sweep_caches();
        drop(guard);

        report.error_flag = !report.errors.is_empty();
        report.finished_at = format_timestamp(self.service.clock().now());

        if let Err(error) = self.persist_report(&report).await {
            tracing::warn!(%error, "failed to persist maintenance report");
        }

        tracing::info!(
            run_id = %report.run_id,
            aggregated = report.aggregated_count,
            pruned = report.pruned_count,
            error_flag = report.error_flag,
            "maintenance run finished"
        );
        report
    }

    /// The report of the most recent completed run, if any.
    pub async fn last_report(&self) -> Result<Option<MaintenanceReport>> {
        let Some(json) = self.service.store().db().get_state(LAST_RUN_STATE_KEY).await? else {
            return Ok(None);
        };
        let report = serde_json::from_str(&json).context("failed to decode last maintenance report")?;
        Ok(Some(report))
    }

    fn try_begin(&self) -> Option<PhaseGuard<'_>> {
        let mut phase = self.phase.lock().expect("phase lock poisoned");
        if *phase != MaintenancePhase::Idle {
            return None;
        }
        *phase = MaintenancePhase::Aggregating;
        Some(PhaseGuard { phase: &self.phase })
    }

    async fn aggregate_bucket(
        &self,
        page_id: i64,
        bucket_key: &str,
        granularity: Granularity,
        created_at: &str,
    ) -> Result<bool> {
        let start_date = parse_bucket_key(bucket_key).ok_or_else(|| {
            Error::Validation(format!("raw rows with unreadable created_at (bucket {bucket_key})"))
        })?;
        let (start, end) = bucket_bounds(start_date, granularity);
        let period_start = start.format(TIMESTAMP_FORMAT).to_string();
        let period_end = end.format(TIMESTAMP_FORMAT).to_string();

        let store = self.service.store();
        if store
            .aggregate_exists(page_id, &period_start, &period_end, granularity)
            .await?
        {
            return Ok(false);
        }

        let covered_until = (end + Duration::seconds(1))
            .format(TIMESTAMP_FORMAT)
            .to_string();

        let Some(totals) = store
            .bucket_totals(page_id, &period_start, &period_end, &covered_until)
            .await?
        else {
            return Ok(false);
        };

        let avg_performance_score = sanitize_score(totals.avg_performance_score)
            .unwrap_or_else(|| {
                let avg_load_time = totals.total_load_time / totals.views.max(1) as f64;
                compute_performance_score(avg_load_time, self.service.settings())
            });

        let inserted = store
            .insert_aggregate(&NewAggregate {
                page_id,
                period_start: &period_start,
                period_end: &period_end,
                granularity,
                totals: &totals,
                avg_performance_score,
                covered_until: &covered_until,
                created_at,
            })
            .await?;
        Ok(inserted)
    }

    async fn persist_report(&self, report: &MaintenanceReport) -> Result<()> {
        let json = serde_json::to_string(report).context("failed to encode maintenance report")?;
        self.service
            .store()
            .db()
            .set_state(LAST_RUN_STATE_KEY, json)
            .await
    }
}

impl std::fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionManager")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Run maintenance on a fixed interval until the task is aborted.
///
/// The first tick fires immediately. Missed ticks are skipped rather than
/// bunched, so a slow run never queues a burst of back-to-back runs.
pub fn spawn_maintenance_loop(
    manager: Arc<RetentionManager>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = interval.max(std::time::Duration::from_secs(1));
        tracing::info!(interval_secs = interval.as_secs(), "maintenance loop started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let report = manager.run_scheduled_maintenance().await;
            if report.error_flag {
                tracing::warn!(
                    run_id = %report.run_id,
                    errors = ?report.errors,
                    "maintenance run finished with errors"
                );
            }
        }
    })
}
