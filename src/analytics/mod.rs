//! Analytics collaborator.
//!
//! The retry orchestrator reports request outcomes here when the operation
//! context carries a request id. Sink failures are logged and dropped by the
//! caller; they never affect control flow.

mod sqlite;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use sqlite::SqliteAnalytics;

use crate::fault::FaultSummary;

#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("analytics database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to run analytics migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("failed to encode metric tags: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One stored metric sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_api_response(
        &self,
        request_id: &str,
        status: Option<u16>,
        response_time: Duration,
        response_size: Option<u64>,
    ) -> Result<(), AnalyticsError>;

    async fn record_api_error(&self, request_id: &str, fault: &FaultSummary) -> Result<(), AnalyticsError>;

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), AnalyticsError>;

    /// Most recent samples of `name`, newest first.
    async fn recent_metrics(&self, name: &str, limit: u32) -> Result<Vec<MetricPoint>, AnalyticsError>;
}
