//! MetricsStore: SQL against the raw and aggregated metric tables.
//!
//! All values travel as bound parameters. The only text ever spliced into a
//! statement is a fixed bucket expression chosen by matching on
//! [`Granularity`], or a fixed scope filter chosen by matching on [`Scope`].

use crate::db::Db;
use crate::error::Result;
use crate::metrics::bucket::bucket_sql;
use crate::metrics::{AggregatedPeriodRecord, Granularity, PageView, Scope};

use sqlx::Row as _;

use std::sync::Arc;

/// Derived figures stored alongside a page view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DerivedMetrics {
    pub carbon_footprint: f64,
    pub energy_consumption: f64,
    pub performance_score: f64,
}

/// Raw sums and averages over a scope.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScopeTotals {
    pub views: i64,
    pub total_data_transfer: i64,
    pub avg_load_time: Option<f64>,
    pub avg_performance_score: Option<f64>,
    pub total_requests: i64,
    pub total_energy_consumption: f64,
    pub total_carbon_footprint: f64,
}

/// One row of a date-bucketed series.
#[derive(Debug, Clone)]
pub(crate) struct SeriesRow {
    pub bucket_key: String,
    pub views: i64,
    pub total_bytes: f64,
    pub carbon_footprint: f64,
    pub energy_consumption: f64,
    pub requests: i64,
    pub avg_load_time: f64,
}

/// Sums over the raw rows of one (page, bucket) pair.
#[derive(Debug, Clone)]
pub(crate) struct BucketTotals {
    pub views: i64,
    pub total_data_transfer: i64,
    pub total_load_time: f64,
    pub total_requests: i64,
    pub total_carbon_footprint: f64,
    pub total_energy_consumption: f64,
    pub avg_performance_score: Option<f64>,
}

/// A rollup ready to insert.
#[derive(Debug, Clone)]
pub(crate) struct NewAggregate<'a> {
    pub page_id: i64,
    pub period_start: &'a str,
    pub period_end: &'a str,
    pub granularity: Granularity,
    pub totals: &'a BucketTotals,
    pub avg_performance_score: f64,
    pub covered_until: &'a str,
    pub created_at: &'a str,
}

#[derive(Debug, Clone)]
pub struct MetricsStore {
    db: Arc<Db>,
}

impl MetricsStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub(crate) async fn insert_raw(
        &self,
        view: &PageView,
        derived: DerivedMetrics,
        created_at: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO page_metrics
                (page_id, data_transfer, load_time, requests,
                 carbon_footprint, energy_consumption, performance_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(view.page_id)
        .bind(view.data_transfer)
        .bind(view.load_time)
        .bind(view.requests)
        .bind(derived.carbon_footprint)
        .bind(derived.energy_consumption)
        .bind(derived.performance_score)
        .bind(created_at)
        .execute(self.db.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub(crate) async fn scope_totals(&self, scope: Scope) -> Result<ScopeTotals> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*)                                          AS views,
                COALESCE(SUM(data_transfer), 0)                   AS total_data_transfer,
                CAST(AVG(load_time) AS REAL)                      AS avg_load_time,
                CAST(AVG(performance_score) AS REAL)              AS avg_performance_score,
                COALESCE(SUM(requests), 0)                        AS total_requests,
                CAST(COALESCE(SUM(energy_consumption), 0) AS REAL) AS total_energy_consumption,
                CAST(COALESCE(SUM(carbon_footprint), 0) AS REAL)   AS total_carbon_footprint
            FROM page_metrics
            {}
            "#,
            scope_filter(scope)
        );

        let mut query = sqlx::query(&sql);
        if let Some(page_id) = scope.page_id() {
            query = query.bind(page_id);
        }
        let row = query.fetch_one(self.db.pool()).await?;

        Ok(ScopeTotals {
            views: row.try_get("views")?,
            total_data_transfer: row.try_get("total_data_transfer")?,
            avg_load_time: row.try_get("avg_load_time")?,
            avg_performance_score: row.try_get("avg_performance_score")?,
            total_requests: row.try_get("total_requests")?,
            total_energy_consumption: row.try_get("total_energy_consumption")?,
            total_carbon_footprint: row.try_get("total_carbon_footprint")?,
        })
    }

    pub(crate) async fn count(&self, scope: Scope) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM page_metrics {}", scope_filter(scope));
        let mut query = sqlx::query_as::<_, (i64,)>(&sql);
        if let Some(page_id) = scope.page_id() {
            query = query.bind(page_id);
        }
        let (count,) = query.fetch_one(self.db.pool()).await?;
        Ok(count)
    }

    /// Load times at ranks `offset..offset + limit` in ascending order. Only
    /// the requested window is read.
    pub(crate) async fn load_time_window(
        &self,
        scope: Scope,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<f64>> {
        let sql = format!(
            "SELECT CAST(load_time AS REAL) FROM page_metrics {} \
             ORDER BY load_time ASC, id ASC LIMIT ? OFFSET ?",
            scope_filter(scope)
        );
        let mut query = sqlx::query_as::<_, (f64,)>(&sql);
        if let Some(page_id) = scope.page_id() {
            query = query.bind(page_id);
        }
        let rows = query
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.into_iter().map(|(value,)| value).collect())
    }

    /// Per-bucket sums across all pages for `from <= created_at < until`,
    /// ascending by bucket. Empty buckets are absent.
    pub(crate) async fn series_rows(
        &self,
        from: &str,
        until: &str,
        granularity: Granularity,
    ) -> Result<Vec<SeriesRow>> {
        let sql = format!(
            r#"
            SELECT
                {bucket}                                          AS bucket_key,
                COUNT(*)                                          AS views,
                CAST(COALESCE(SUM(data_transfer), 0) AS REAL)      AS total_bytes,
                CAST(COALESCE(SUM(carbon_footprint), 0) AS REAL)   AS carbon_footprint,
                CAST(COALESCE(SUM(energy_consumption), 0) AS REAL) AS energy_consumption,
                COALESCE(SUM(requests), 0)                        AS requests,
                CAST(COALESCE(AVG(load_time), 0) AS REAL)          AS avg_load_time
            FROM page_metrics
            WHERE created_at >= ? AND created_at < ?
            GROUP BY bucket_key
            ORDER BY bucket_key ASC
            "#,
            bucket = bucket_sql(granularity)
        );

        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(until)
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SeriesRow {
                    bucket_key: row.try_get("bucket_key")?,
                    views: row.try_get("views")?,
                    total_bytes: row.try_get("total_bytes")?,
                    carbon_footprint: row.try_get("carbon_footprint")?,
                    energy_consumption: row.try_get("energy_consumption")?,
                    requests: row.try_get("requests")?,
                    avg_load_time: row.try_get("avg_load_time")?,
                })
            })
            .collect()
    }

    /// Distinct (page, bucket start) pairs with raw rows older than `cutoff`
    /// and no rollup yet, oldest bucket first, at most `limit` of them.
    ///
    /// The bucket key is `None` for rows whose `created_at` SQLite cannot
    /// read as a timestamp.
    pub(crate) async fn pending_buckets(
        &self,
        cutoff: &str,
        granularity: Granularity,
        limit: i64,
    ) -> Result<Vec<(i64, Option<String>)>> {
        let sql = format!(
            r#"
            WITH buckets AS (
                SELECT DISTINCT page_id, {bucket} AS bucket_key
                FROM page_metrics
                WHERE created_at < ?
            )
            SELECT b.page_id, b.bucket_key
            FROM buckets b
            WHERE NOT EXISTS (
                SELECT 1 FROM page_metrics_aggregated a
                WHERE a.page_id = b.page_id
                  AND a.granularity = ?
                  AND a.period_start = b.bucket_key || ' 00:00:00'
            )
            ORDER BY b.bucket_key ASC, b.page_id ASC
            LIMIT ?
            "#,
            bucket = bucket_sql(granularity)
        );

        let rows: Vec<(i64, Option<String>)> = sqlx::query_as(&sql)
            .bind(cutoff)
            .bind(granularity.as_str())
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows)
    }

    pub(crate) async fn aggregate_exists(
        &self,
        page_id: i64,
        period_start: &str,
        period_end: &str,
        granularity: Granularity,
    ) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM page_metrics_aggregated
            WHERE page_id = ? AND period_start = ? AND period_end = ? AND granularity = ?
            "#,
        )
        .bind(page_id)
        .bind(period_start)
        .bind(period_end)
        .bind(granularity.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(count > 0)
    }

    /// Sums over one page's raw rows inside `[period_start, period_end]` that
    /// were created before `before`. `None` when no row qualifies.
    pub(crate) async fn bucket_totals(
        &self,
        page_id: i64,
        period_start: &str,
        period_end: &str,
        before: &str,
    ) -> Result<Option<BucketTotals>> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)                                          AS views,
                COALESCE(SUM(data_transfer), 0)                   AS total_data_transfer,
                CAST(COALESCE(SUM(load_time), 0) AS REAL)          AS total_load_time,
                COALESCE(SUM(requests), 0)                        AS total_requests,
                CAST(COALESCE(SUM(carbon_footprint), 0) AS REAL)   AS total_carbon_footprint,
                CAST(COALESCE(SUM(energy_consumption), 0) AS REAL) AS total_energy_consumption,
                CAST(AVG(performance_score) AS REAL)              AS avg_performance_score
            FROM page_metrics
            WHERE page_id = ?
              AND created_at >= ?
              AND created_at <= ?
              AND created_at < ?
            "#,
        )
        .bind(page_id)
        .bind(period_start)
        .bind(period_end)
        .bind(before)
        .fetch_one(self.db.pool())
        .await?;

        let views: i64 = row.try_get("views")?;
        if views == 0 {
            return Ok(None);
        }

        Ok(Some(BucketTotals {
            views,
            total_data_transfer: row.try_get("total_data_transfer")?,
            total_load_time: row.try_get("total_load_time")?,
            total_requests: row.try_get("total_requests")?,
            total_carbon_footprint: row.try_get("total_carbon_footprint")?,
            total_energy_consumption: row.try_get("total_energy_consumption")?,
            avg_performance_score: row.try_get("avg_performance_score")?,
        }))
    }

    /// Insert a rollup. Returns false when an identical period already exists,
    /// which makes a racing duplicate run harmless.
    pub(crate) async fn insert_aggregate(&self, aggregate: &NewAggregate<'_>) -> Result<bool> {
        let totals = aggregate.totals;
        let views = totals.views.max(1) as f64;

        let result = sqlx::query(
            r#"
            INSERT INTO page_metrics_aggregated
                (page_id, period_start, period_end, granularity, views,
                 total_data_transfer, avg_data_transfer,
                 total_load_time, avg_load_time,
                 total_requests, avg_requests,
                 total_carbon_footprint, avg_carbon_footprint,
                 total_energy_consumption, avg_energy_consumption,
                 avg_performance_score, covered_until, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (page_id, period_start, period_end, granularity) DO NOTHING
            "#,
        )
        .bind(aggregate.page_id)
        .bind(aggregate.period_start)
        .bind(aggregate.period_end)
        .bind(aggregate.granularity.as_str())
        .bind(totals.views)
        .bind(totals.total_data_transfer)
        .bind(totals.total_data_transfer as f64 / views)
        .bind(totals.total_load_time)
        .bind(totals.total_load_time / views)
        .bind(totals.total_requests)
        .bind(totals.total_requests as f64 / views)
        .bind(totals.total_carbon_footprint)
        .bind(totals.total_carbon_footprint / views)
        .bind(totals.total_energy_consumption)
        .bind(totals.total_energy_consumption / views)
        .bind(aggregate.avg_performance_score)
        .bind(aggregate.covered_until)
        .bind(aggregate.created_at)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete at most `limit` raw rows created before `cutoff`.
    ///
    /// With `covered_by` set, only rows that a rollup of that granularity
    /// actually summed are eligible.
    pub(crate) async fn prune_raw(
        &self,
        cutoff: &str,
        covered_by: Option<Granularity>,
        limit: i64,
    ) -> Result<u64> {
        let result = match covered_by {
            Some(granularity) => {
                sqlx::query(
                    r#"
                    DELETE FROM page_metrics WHERE id IN (
                        SELECT r.id FROM page_metrics r
                        WHERE r.created_at < ?
                          AND EXISTS (
                              SELECT 1 FROM page_metrics_aggregated a
                              WHERE a.page_id = r.page_id
                                AND a.granularity = ?
                                AND r.created_at >= a.period_start
                                AND r.created_at <= a.period_end
                                AND r.created_at < a.covered_until
                          )
                        ORDER BY r.id ASC
                        LIMIT ?
                    )
                    "#,
                )
                .bind(cutoff)
                .bind(granularity.as_str())
                .bind(limit)
                .execute(self.db.pool())
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM page_metrics WHERE id IN (
                        SELECT id FROM page_metrics
                        WHERE created_at < ?
                        ORDER BY id ASC
                        LIMIT ?
                    )
                    "#,
                )
                .bind(cutoff)
                .bind(limit)
                .execute(self.db.pool())
                .await?
            }
        };

        Ok(result.rows_affected())
    }

    pub(crate) async fn list_aggregates(
        &self,
        page_id: Option<i64>,
        granularity: Granularity,
    ) -> Result<Vec<AggregatedPeriodRecord>> {
        let records = sqlx::query_as::<_, AggregatedPeriodRecord>(
            r#"
            SELECT id, page_id, period_start, period_end, granularity, views,
                   total_data_transfer, avg_data_transfer,
                   total_load_time, avg_load_time,
                   total_requests, avg_requests,
                   total_carbon_footprint, avg_carbon_footprint,
                   total_energy_consumption, avg_energy_consumption,
                   avg_performance_score, covered_until, created_at
            FROM page_metrics_aggregated
            WHERE granularity = ? AND (? IS NULL OR page_id = ?)
            ORDER BY period_start ASC, page_id ASC
            "#,
        )
        .bind(granularity.as_str())
        .bind(page_id)
        .bind(page_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }
}

fn scope_filter(scope: Scope) -> &'static str {
    match scope {
        Scope::Page(_) => "WHERE page_id = ?",
        Scope::All => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> MetricsStore {
        let path = std::env::temp_dir().join(format!(
            "carbonmeter_test_store_{}.db",
            uuid::Uuid::new_v4()
        ));
        MetricsStore::new(Db::connect(&path).await.unwrap())
    }

    fn derived(score: f64) -> DerivedMetrics {
        DerivedMetrics {
            carbon_footprint: 0.5,
            energy_consumption: 0.001,
            performance_score: score,
        }
    }

    async fn insert(store: &MetricsStore, page_id: i64, load_time: f64, created_at: &str) {
        let view = PageView {
            page_id,
            data_transfer: 2048,
            load_time,
            requests: 4,
        };
        store.insert_raw(&view, derived(90.0), created_at).await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_totals_filters_by_page() {
        let store = setup().await;
        insert(&store, 1, 1.0, "2024-01-01 10:00:00").await;
        insert(&store, 1, 3.0, "2024-01-01 11:00:00").await;
        insert(&store, 2, 5.0, "2024-01-01 12:00:00").await;

        let page = store.scope_totals(Scope::Page(1)).await.unwrap();
        assert_eq!(page.views, 2);
        assert_eq!(page.total_data_transfer, 4096);
        assert_eq!(page.total_requests, 8);
        assert_eq!(page.avg_load_time, Some(2.0));

        let all = store.scope_totals(Scope::All).await.unwrap();
        assert_eq!(all.views, 3);
        assert!((all.total_carbon_footprint - 1.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_scope_totals_on_empty_table() {
        let store = setup().await;
        let totals = store.scope_totals(Scope::All).await.unwrap();
        assert_eq!(totals.views, 0);
        assert_eq!(totals.avg_load_time, None);
        assert_eq!(totals.avg_performance_score, None);
        assert_eq!(totals.total_energy_consumption, 0.0);
    }

    #[tokio::test]
    async fn test_load_time_window_reads_only_requested_ranks() {
        let store = setup().await;
        for load_time in [4.0, 1.0, 3.0, 2.0] {
            insert(&store, 9, load_time, "2024-01-01 10:00:00").await;
        }

        let window = store.load_time_window(Scope::Page(9), 1, 2).await.unwrap();
        assert_eq!(window, vec![2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_pending_buckets_skip_aggregated_periods() {
        let store = setup().await;
        insert(&store, 1, 1.0, "2024-01-01 10:00:00").await;
        insert(&store, 1, 1.0, "2024-01-02 10:00:00").await;

        let pending = store
            .pending_buckets("2024-01-03 00:00:00", Granularity::Daily, 100)
            .await
            .unwrap();
        assert_eq!(
            pending,
            vec![
                (1, Some("2024-01-01".to_string())),
                (1, Some("2024-01-02".to_string()))
            ]
        );

        let totals = store
            .bucket_totals(1, "2024-01-01 00:00:00", "2024-01-01 23:59:59", "2024-01-03 00:00:00")
            .await
            .unwrap()
            .unwrap();
        let inserted = store
            .insert_aggregate(&NewAggregate {
                page_id: 1,
                period_start: "2024-01-01 00:00:00",
                period_end: "2024-01-01 23:59:59",
                granularity: Granularity::Daily,
                totals: &totals,
                avg_performance_score: 90.0,
                covered_until: "2024-01-01 23:59:59",
                created_at: "2024-01-03 00:00:00",
            })
            .await
            .unwrap();
        assert!(inserted);

        let pending = store
            .pending_buckets("2024-01-03 00:00:00", Granularity::Daily, 100)
            .await
            .unwrap();
        assert_eq!(pending, vec![(1, Some("2024-01-02".to_string()))]);
    }

    #[tokio::test]
    async fn test_insert_aggregate_conflict_is_not_an_error() {
        let store = setup().await;
        insert(&store, 1, 1.0, "2024-01-01 10:00:00").await;
        let totals = store
            .bucket_totals(1, "2024-01-01 00:00:00", "2024-01-01 23:59:59", "2024-01-02 00:00:00")
            .await
            .unwrap()
            .unwrap();
        let aggregate = NewAggregate {
            page_id: 1,
            period_start: "2024-01-01 00:00:00",
            period_end: "2024-01-01 23:59:59",
            granularity: Granularity::Daily,
            totals: &totals,
            avg_performance_score: 90.0,
            covered_until: "2024-01-02 00:00:00",
            created_at: "2024-01-02 00:00:00",
        };

        assert!(store.insert_aggregate(&aggregate).await.unwrap());
        assert!(!store.insert_aggregate(&aggregate).await.unwrap());
        assert!(
            store
                .aggregate_exists(1, "2024-01-01 00:00:00", "2024-01-01 23:59:59", Granularity::Daily)
                .await
                .unwrap()
        );
        assert_eq!(store.list_aggregates(Some(1), Granularity::Daily).await.unwrap().len(), 1);
        assert!(store.list_aggregates(Some(2), Granularity::Daily).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconditional_prune_respects_limit() {
        let store = setup().await;
        for hour in 10..15 {
            insert(&store, 1, 1.0, &format!("2024-01-01 {hour}:00:00")).await;
        }

        let pruned = store.prune_raw("2024-01-02 00:00:00", None, 3).await.unwrap();
        assert_eq!(pruned, 3);
        assert_eq!(store.count(Scope::All).await.unwrap(), 2);
    }
}
