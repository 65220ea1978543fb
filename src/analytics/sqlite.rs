//! SQLite-backed [`AnalyticsSink`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use super::{AnalyticsError, AnalyticsSink, MetricPoint};
use crate::fault::FaultSummary;

/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Clone)]
pub struct SqliteAnalytics {
    pool: SqlitePool,
}

impl SqliteAnalytics {
    /// Opens or creates the database at `path` and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError`] when connecting or migrating fails.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn new(path: &Path) -> Result<Self, AnalyticsError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError`] when connecting or migrating fails.
    pub async fn new_in_memory() -> Result<Self, AnalyticsError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Number of stored error records for `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Database`] when the query fails.
    pub async fn error_count(&self, request_id: &str) -> Result<i64, AnalyticsError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_errors WHERE request_id = ?")
            .bind(request_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Number of stored response records for `request_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Database`] when the query fails.
    pub async fn response_count(&self, request_id: &str) -> Result<i64, AnalyticsError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_responses WHERE request_id = ?")
            .bind(request_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[async_trait]
impl AnalyticsSink for SqliteAnalytics {
    async fn record_api_response(
        &self,
        request_id: &str,
        status: Option<u16>,
        response_time: Duration,
        response_size: Option<u64>,
    ) -> Result<(), AnalyticsError> {
        let millis = i64::try_from(response_time.as_millis()).unwrap_or(i64::MAX);
        let size = response_size.map(|size| i64::try_from(size).unwrap_or(i64::MAX));

        sqlx::query(
            "INSERT INTO api_responses (request_id, status_code, response_time_ms, response_size, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(status.map(i64::from))
        .bind(millis)
        .bind(size)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_api_error(&self, request_id: &str, fault: &FaultSummary) -> Result<(), AnalyticsError> {
        sqlx::query(
            "INSERT INTO api_errors (request_id, fault_name, category, message, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(request_id)
        .bind(&fault.fault_name)
        .bind(fault.category.as_str())
        .bind(&fault.message)
        .bind(fault.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), AnalyticsError> {
        let tags = serde_json::to_string(tags)?;
        sqlx::query("INSERT INTO metrics (name, value, tags, recorded_at) VALUES (?, ?, ?, ?)")
            .bind(name)
            .bind(value)
            .bind(tags)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_metrics(&self, name: &str, limit: u32) -> Result<Vec<MetricPoint>, AnalyticsError> {
        let rows = sqlx::query(
            "SELECT name, value, tags, recorded_at FROM metrics WHERE name = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let tags: String = row.try_get("tags")?;
            let recorded_at: String = row.try_get("recorded_at")?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|error| {
                    debug!(%error, "unparseable metric timestamp");
                    DateTime::<Utc>::UNIX_EPOCH
                });
            points.push(MetricPoint {
                name: row.try_get("name")?,
                value: row.try_get("value")?,
                tags: serde_json::from_str(&tags)?,
                recorded_at,
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fault::{CivitaiApiError, FaultClassifier, OperationContext};

    #[tokio::test]
    async fn test_metrics_round_trip_newest_first() {
        let analytics = SqliteAnalytics::new_in_memory().await.unwrap();
        let tags = BTreeMap::from([("job".to_string(), "j1".to_string())]);
        analytics.record_metric("bytes", 1.0, &tags).await.unwrap();
        analytics.record_metric("bytes", 2.0, &tags).await.unwrap();
        analytics.record_metric("other", 9.0, &BTreeMap::new()).await.unwrap();

        let points = analytics.recent_metrics("bytes", 10).await.unwrap();
        assert_eq!(points.len(), 2);
        assert!((points[0].value - 2.0).abs() < f64::EPSILON);
        assert_eq!(points[0].tags["job"], "j1");
    }

    #[tokio::test]
    async fn test_responses_and_errors_are_counted() {
        let analytics = SqliteAnalytics::new_in_memory().await.unwrap();
        analytics
            .record_api_response("req-1", Some(200), Duration::from_millis(150), Some(1024))
            .await
            .unwrap();

        let ctx = OperationContext::new("search", "api").with_request_id("req-1");
        let error = CivitaiApiError::from_status(500, "boom", None);
        let summary = FaultClassifier::new().wrap(&error, &ctx).summary();
        analytics.record_api_error("req-1", &summary).await.unwrap();

        assert_eq!(analytics.response_count("req-1").await.unwrap(), 1);
        assert_eq!(analytics.error_count("req-1").await.unwrap(), 1);
        assert_eq!(analytics.error_count("req-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let analytics = SqliteAnalytics::new(&path).await.unwrap();
        analytics.record_metric("x", 1.0, &BTreeMap::new()).await.unwrap();
        assert!(path.exists());
    }
}
