//! MetricsService: ingestion, cached aggregates, and the invalidation policy.
//!
//! Writes invalidate the written page's aggregate immediately and drop every
//! cached series, since a new row can land in any bucket. The all-pages
//! aggregate is the expensive one, so it is only recomputed from the write
//! path once `all_scope_refresh_secs` have passed since the last full
//! recompute; inside that window readers see the previous value.

use crate::calculator::{compute_carbon_and_energy, compute_performance_score, sanitize_score};
use crate::clock::{Clock, format_timestamp, parse_timestamp};
use crate::config::Settings;
use crate::db::Db;
use crate::error::Result;
use crate::metrics::cache::TtlCache;
use crate::metrics::store::{DerivedMetrics, MetricsStore};
use crate::metrics::{AggregatedPeriodRecord, Granularity, MetricsSeries, PageStats, PageView, Scope};
use crate::schema::SchemaInspector;

use chrono::{DateTime, Duration, Utc};

use std::sync::{Arc, Mutex};

/// `engine_state` key holding the last all-pages recompute time.
const ALL_REFRESH_STATE_KEY: &str = "stats.all.refreshed_at";

pub(super) const SERIES_CACHE_PREFIX: &str = "series:";

pub struct MetricsService {
    pub(super) settings: Arc<Settings>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) store: MetricsStore,
    pub(super) series_cache: TtlCache<MetricsSeries>,
    schema: SchemaInspector,
    stats_cache: TtlCache<PageStats>,
    last_all_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl MetricsService {
    pub fn new(db: Arc<Db>, settings: Arc<Settings>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: MetricsStore::new(db.clone()),
            schema: SchemaInspector::new(db),
            stats_cache: TtlCache::new(clock.clone()),
            series_cache: TtlCache::new(clock.clone()),
            last_all_refresh: Mutex::new(None),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    pub fn schema(&self) -> &SchemaInspector {
        &self.schema
    }

    /// Validate, derive, and append one page view. Returns the new row id.
    ///
    /// A write that fails because the schema is missing triggers one repair
    /// and one retry; a second failure is returned as-is.
    pub async fn record_page_view(&self, view: PageView) -> Result<i64> {
        view.validate()?;
        self.schema.ensure_raw_table().await?;

        let (carbon_footprint, energy_consumption) =
            compute_carbon_and_energy(view.data_transfer as f64, &self.settings);
        let derived = DerivedMetrics {
            carbon_footprint,
            energy_consumption,
            performance_score: compute_performance_score(view.load_time, &self.settings),
        };
        let created_at = format_timestamp(self.clock.now());

        let id = match self.store.insert_raw(&view, derived, &created_at).await {
            Ok(id) => id,
            Err(error) if error.is_missing_schema() => {
                tracing::warn!(%error, page_id = view.page_id, "insert hit missing schema, repairing");
                self.schema.repair().await?;
                self.store
                    .insert_raw(&view, derived, &created_at)
                    .await
                    .inspect_err(|error| {
                        tracing::error!(%error, page_id = view.page_id, "page view insert failed after repair");
                    })?
            }
            Err(error) => {
                tracing::error!(%error, page_id = view.page_id, "failed to record page view");
                return Err(error);
            }
        };

        self.invalidate_after_write(view.page_id).await;

        tracing::debug!(id, page_id = view.page_id, carbon_footprint, "recorded page view");
        Ok(id)
    }

    /// Aggregate figures for `scope`, served from cache unless missing,
    /// expired, or `force_refresh` is set.
    pub async fn get_stats(&self, scope: Scope, force_refresh: bool) -> Result<PageStats> {
        let key = scope.cache_key();
        if !force_refresh && let Some(stats) = self.stats_cache.get(&key) {
            return Ok(stats);
        }

        let stats = self.compute_stats(scope).await?;
        self.stats_cache.insert(
            key,
            stats.clone(),
            Duration::seconds(self.settings.stats_cache_ttl_secs as i64),
        );

        if scope == Scope::All {
            self.mark_all_refreshed(self.clock.now()).await;
        }

        Ok(stats)
    }

    /// Median load time for `scope`, or `None` when it has no rows.
    ///
    /// Counts first, then reads only the one or two rows at the middle rank,
    /// so memory use does not grow with page history.
    pub async fn get_median_load_time(&self, scope: Scope) -> Result<Option<f64>> {
        let count = self.store.count(scope).await?;
        let Some((offset, limit)) = median_window(count) else {
            return Ok(None);
        };

        let values = self.store.load_time_window(scope, offset, limit).await?;
        if values.is_empty() {
            // Rows pruned between the count and the read.
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    /// Rollups for one page (or every page) at `granularity`, oldest first.
    pub async fn get_aggregated_periods(
        &self,
        page_id: Option<i64>,
        granularity: Granularity,
    ) -> Result<Vec<AggregatedPeriodRecord>> {
        self.store.list_aggregates(page_id, granularity).await
    }

    /// Drop every cached aggregate and series.
    pub fn clear_cache(&self) {
        self.stats_cache.clear();
        self.series_cache.clear();
        tracing::debug!("metrics caches cleared");
    }

    /// Evict expired cache entries. Returns how many were dropped.
    pub fn sweep_caches(&self) -> usize {
        self.stats_cache.sweep() + self.series_cache.sweep()
    }

    async fn compute_stats(&self, scope: Scope) -> Result<PageStats> {
        let totals = self.store.scope_totals(scope).await?;
        let median = self.get_median_load_time(scope).await?;

        let avg_load_time = non_negative(totals.avg_load_time.unwrap_or(0.0));
        let avg_performance_score = if totals.views == 0 {
            100.0
        } else {
            sanitize_score(totals.avg_performance_score)
                .unwrap_or_else(|| compute_performance_score(avg_load_time, &self.settings))
        };

        Ok(PageStats {
            total_views: totals.views.max(0),
            total_data_transfer: totals.total_data_transfer.max(0),
            avg_load_time,
            median_load_time: median.map(non_negative).unwrap_or(avg_load_time),
            total_requests: totals.total_requests.max(0),
            avg_performance_score,
            total_energy_consumption: non_negative(totals.total_energy_consumption),
            total_carbon_footprint: non_negative(totals.total_carbon_footprint),
        })
    }

    async fn invalidate_after_write(&self, page_id: i64) {
        self.stats_cache.remove(&Scope::Page(page_id).cache_key());
        self.series_cache.remove_prefix(SERIES_CACHE_PREFIX);

        if let Err(error) = self.refresh_all_if_due().await {
            tracing::warn!(%error, "failed to refresh all-pages aggregate");
        }
    }

    /// Recompute the all-pages aggregate when the throttle window has passed.
    async fn refresh_all_if_due(&self) -> Result<bool> {
        let now = self.clock.now();
        let interval = Duration::seconds(self.settings.all_scope_refresh_secs as i64);

        if let Some(last) = self.last_all_refresh().await
            && now - last <= interval
        {
            return Ok(false);
        }

        // Claim the slot before recomputing so concurrent writers in this
        // process skip instead of piling on.
        *self
            .last_all_refresh
            .lock()
            .expect("last_all_refresh lock poisoned") = Some(now);

        self.stats_cache.remove(&Scope::All.cache_key());
        self.get_stats(Scope::All, true).await?;
        tracing::debug!("refreshed all-pages aggregate");
        Ok(true)
    }

    async fn last_all_refresh(&self) -> Option<DateTime<Utc>> {
        let cached = *self
            .last_all_refresh
            .lock()
            .expect("last_all_refresh lock poisoned");
        if cached.is_some() {
            return cached;
        }

        let persisted = match self.store.db().get_state(ALL_REFRESH_STATE_KEY).await {
            Ok(value) => value.as_deref().and_then(parse_timestamp),
            Err(error) => {
                tracing::warn!(%error, "failed to read all-pages refresh timestamp");
                None
            }
        };
        if persisted.is_some() {
            *self
                .last_all_refresh
                .lock()
                .expect("last_all_refresh lock poisoned") = persisted;
        }
        persisted
    }

    async fn mark_all_refreshed(&self, at: DateTime<Utc>) {
        *self
            .last_all_refresh
            .lock()
            .expect("last_all_refresh lock poisoned") = Some(at);
        if let Err(error) = self
            .store
            .db()
            .set_state(ALL_REFRESH_STATE_KEY, format_timestamp(at))
            .await
        {
            tracing::warn!(%error, "failed to persist all-pages refresh timestamp");
        }
    }
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService").finish_non_exhaustive()
    }
}

/// `(offset, limit)` of the middle rank(s) among `count` ascending values:
/// one row for an odd count, the two central rows for an even count.
pub(crate) fn median_window(count: i64) -> Option<(i64, i64)> {
    if count <= 0 {
        None
    } else if count % 2 == 1 {
        Some((count / 2, 1))
    } else {
        Some((count / 2 - 1, 2))
    }
}

pub(super) fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;
    use chrono::TimeZone as _;

    async fn setup() -> (Arc<ManualClock>, MetricsService) {
        let path = std::env::temp_dir().join(format!(
            "carbonmeter_test_service_{}.db",
            uuid::Uuid::new_v4()
        ));
        let db = Db::connect(&path).await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap(),
        ));
        let service = MetricsService::new(db, Arc::new(Settings::default()), clock.clone());
        (clock, service)
    }

    fn view(page_id: i64, load_time: f64) -> PageView {
        PageView {
            page_id,
            data_transfer: 500_000,
            load_time,
            requests: 20,
        }
    }

    #[test]
    fn test_median_window_ranks() {
        assert_eq!(median_window(0), None);
        assert_eq!(median_window(1), Some((0, 1)));
        assert_eq!(median_window(3), Some((1, 1)));
        assert_eq!(median_window(4), Some((1, 2)));
        assert_eq!(median_window(5), Some((2, 1)));
    }

    #[tokio::test]
    async fn test_median_odd_even_and_empty() {
        let (_clock, service) = setup().await;
        assert_eq!(service.get_median_load_time(Scope::Page(1)).await.unwrap(), None);

        for load_time in [3.0, 1.0, 2.0] {
            service.record_page_view(view(1, load_time)).await.unwrap();
        }
        assert_eq!(service.get_median_load_time(Scope::Page(1)).await.unwrap(), Some(2.0));

        service.record_page_view(view(1, 4.0)).await.unwrap();
        assert_eq!(service.get_median_load_time(Scope::Page(1)).await.unwrap(), Some(2.5));
    }

    #[tokio::test]
    async fn test_invalid_view_is_rejected_before_write() {
        let (_clock, service) = setup().await;
        let error = service.record_page_view(view(-1, 1.0)).await.unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
        assert_eq!(service.store().count(Scope::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_record_derives_metrics() {
        let (_clock, service) = setup().await;
        let id = service.record_page_view(view(3, 0.3)).await.unwrap();

        let record: crate::metrics::RawMetricRecord =
            sqlx::query_as("SELECT * FROM page_metrics WHERE id = ?")
                .bind(id)
                .fetch_one(service.store().db().pool())
                .await
                .unwrap();
        let (carbon, energy) = compute_carbon_and_energy(500_000.0, service.settings());
        assert_eq!(record.performance_score, 100.0);
        assert!((record.energy_consumption - energy).abs() < 1e-15);
        assert!((record.carbon_footprint - carbon).abs() < 1e-12);
        assert_eq!(record.created_at, "2024-04-10 09:00:00");
    }

    #[tokio::test]
    async fn test_empty_scope_stats() {
        let (_clock, service) = setup().await;
        let stats = service.get_stats(Scope::Page(99), false).await.unwrap();
        assert_eq!(stats, PageStats::default());
    }

    #[tokio::test]
    async fn test_consecutive_reads_are_identical() {
        let (_clock, service) = setup().await;
        service.record_page_view(view(1, 1.2)).await.unwrap();
        service.record_page_view(view(2, 0.4)).await.unwrap();

        for scope in [Scope::Page(1), Scope::All] {
            let first = service.get_stats(scope, false).await.unwrap();
            let second = service.get_stats(scope, false).await.unwrap();
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn test_cached_stats_survive_out_of_band_change_until_forced() {
        let (_clock, service) = setup().await;
        service.record_page_view(view(1, 1.0)).await.unwrap();
        let cached = service.get_stats(Scope::Page(1), false).await.unwrap();

        sqlx::query("DELETE FROM page_metrics")
            .execute(service.store().db().pool())
            .await
            .unwrap();

        assert_eq!(service.get_stats(Scope::Page(1), false).await.unwrap(), cached);
        assert_eq!(service.get_stats(Scope::Page(1), true).await.unwrap().total_views, 0);
    }

    #[tokio::test]
    async fn test_page_stats_reflect_write_immediately() {
        let (_clock, service) = setup().await;
        service.record_page_view(view(7, 1.0)).await.unwrap();
        assert_eq!(service.get_stats(Scope::Page(7), false).await.unwrap().total_views, 1);

        service.record_page_view(view(7, 2.0)).await.unwrap();
        let stats = service.get_stats(Scope::Page(7), false).await.unwrap();
        assert_eq!(stats.total_views, 2);
        assert_eq!(stats.total_data_transfer, 1_000_000);
        assert_eq!(stats.median_load_time, 1.5);
    }

    #[tokio::test]
    async fn test_all_scope_is_throttled() {
        let (clock, service) = setup().await;
        service.record_page_view(view(1, 1.0)).await.unwrap();
        let before = service.get_stats(Scope::All, false).await.unwrap();
        assert_eq!(before.total_views, 1);

        // Inside the window the all-pages value is left alone.
        clock.advance(Duration::minutes(2));
        service.record_page_view(view(2, 1.0)).await.unwrap();
        assert_eq!(service.get_stats(Scope::All, false).await.unwrap(), before);
        assert_eq!(service.get_stats(Scope::Page(2), false).await.unwrap().total_views, 1);

        // Past the window the next write refreshes it eagerly.
        clock.advance(Duration::minutes(4));
        service.record_page_view(view(3, 1.0)).await.unwrap();
        assert_eq!(service.get_stats(Scope::All, false).await.unwrap().total_views, 3);
    }

    #[tokio::test]
    async fn test_refresh_timestamp_is_persisted() {
        let (clock, service) = setup().await;
        service.get_stats(Scope::All, false).await.unwrap();

        let stored = service
            .store()
            .db()
            .get_state(ALL_REFRESH_STATE_KEY)
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some("2024-04-10 09:00:00"));

        // A second service over the same database honours the stored time.
        let other = MetricsService::new(
            service.store().db().clone(),
            Arc::new(Settings::default()),
            clock.clone(),
        );
        assert_eq!(
            other.last_all_refresh().await,
            Some(Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_stats_cache_expires_after_ttl() {
        let (clock, service) = setup().await;
        service.record_page_view(view(1, 1.0)).await.unwrap();
        service.get_stats(Scope::Page(1), false).await.unwrap();

        sqlx::query("DELETE FROM page_metrics")
            .execute(service.store().db().pool())
            .await
            .unwrap();

        clock.advance(Duration::hours(25));
        assert_eq!(service.get_stats(Scope::Page(1), false).await.unwrap().total_views, 0);
    }

    #[tokio::test]
    async fn test_out_of_range_stored_score_is_recomputed() {
        let (_clock, service) = setup().await;
        service.record_page_view(view(5, 0.2)).await.unwrap();
        sqlx::query("UPDATE page_metrics SET performance_score = 250")
            .execute(service.store().db().pool())
            .await
            .unwrap();

        let stats = service.get_stats(Scope::Page(5), true).await.unwrap();
        assert_eq!(stats.avg_performance_score, 100.0);
    }

    #[tokio::test]
    async fn test_write_repairs_dropped_table() {
        let (_clock, service) = setup().await;
        service.record_page_view(view(1, 1.0)).await.unwrap();

        // The schema cache still believes the table exists, so the insert
        // itself fails and takes the repair path.
        sqlx::query("DROP TABLE page_metrics")
            .execute(service.store().db().pool())
            .await
            .unwrap();

        service.record_page_view(view(1, 1.0)).await.unwrap();
        assert_eq!(service.store().count(Scope::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_against_unrepairable_table_fails_without_insert() {
        let (_clock, service) = setup().await;
        let pool = service.store().db().pool();
        sqlx::query("DROP TABLE page_metrics")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE page_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                page_id INTEGER NOT NULL,
                data_transfer INTEGER NOT NULL DEFAULT 0,
                load_time REAL NOT NULL DEFAULT 0,
                requests INTEGER NOT NULL DEFAULT 0,
                carbon_footprint REAL NOT NULL DEFAULT 0,
                energy_consumption REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .unwrap();

        let error = service.record_page_view(view(1, 1.0)).await.unwrap_err();
        assert!(matches!(error, Error::Schema(_)), "{error}");

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM page_metrics")
            .fetch_one(pool)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }
}
