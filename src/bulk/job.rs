//! Bulk job state, options and reports.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{FileDescriptor, ModelSearchResult};
use crate::config::ConfigError;
use crate::scan::ScanVerdict;
use crate::transfer::{TaskHandle, TransferStatus};

/// Lifecycle of a [`BulkJob`].
///
/// `Pending -> Processing -> {Completed, Failed, Cancelled}`, with
/// `Processing <-> Paused` in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl BulkStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Processing or paused.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Processing | Self::Paused)
    }
}

impl fmt::Display for BulkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How files of a job are grouped and dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    /// One file at a time.
    Sequential,
    /// `max_concurrent` files at a time.
    Parallel,
    /// Concurrency read from the optimizer before every batch.
    #[default]
    Adaptive,
}

impl FromStr for BatchStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown batch strategy `{other}`")),
        }
    }
}

/// `[bulk]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Files per batch; the next batch starts once the previous one settles.
    pub batch_size: usize,
    /// Concurrency cap for `parallel`, fallback for `adaptive` without an optimizer.
    pub max_concurrent: usize,
    pub strategy: BatchStrategy,
    /// Overrides the category retry budget for file transfers.
    pub file_retries: Option<u32>,
    /// Use the optimizer's network-aware delay for network faults.
    pub network_aware_retries: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 3,
            strategy: BatchStrategy::Adaptive,
            file_retries: None,
            network_aware_retries: true,
        }
    }
}

impl BatchConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero batch size or concurrency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("bulk.batch_size", "must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("bulk.max_concurrent", "must be at least 1"));
        }
        Ok(())
    }
}

/// Caller-supplied options for one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Only the first (newest) version of each model.
    pub latest_version_only: bool,
    /// Only files flagged as primary.
    pub primary_only: bool,
    /// Download root; the manager's default when unset.
    pub output_dir: Option<PathBuf>,
    /// Free-form values carried into reports.
    pub extras: BTreeMap<String, Value>,
}

/// How one file of a job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Downloaded {
        path: PathBuf,
        bytes: u64,
        resumed: bool,
    },
    /// Transfer succeeded but the scan did not pass it.
    Rejected {
        path: PathBuf,
        verdict: ScanVerdict,
        findings: Vec<String>,
    },
    Failed {
        fault_name: String,
        category: String,
        message: String,
    },
}

impl FileOutcome {
    #[must_use]
    pub fn is_downloaded(&self) -> bool {
        matches!(self, Self::Downloaded { .. })
    }
}

/// One submitted unit of many-file download work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkJob {
    pub id: String,
    pub name: String,
    pub sources: Vec<ModelSearchResult>,
    pub files: Vec<FileDescriptor>,
    pub status: BulkStatus,
    pub total_files: usize,
    pub downloaded_files: usize,
    pub failed_files: usize,
    pub total_size_bytes: u64,
    /// File index to transfer handle, filled as transfers start.
    pub download_tasks: BTreeMap<usize, TaskHandle>,
    /// File index to outcome, filled as files settle.
    pub file_outcomes: BTreeMap<usize, FileOutcome>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub options: JobOptions,
    pub errors: Vec<String>,
}

impl BulkJob {
    pub(crate) fn new(
        id: String,
        name: String,
        sources: Vec<ModelSearchResult>,
        files: Vec<FileDescriptor>,
        options: JobOptions,
    ) -> Self {
        let total_size_bytes = files.iter().filter_map(|file| file.size_bytes).sum();
        Self {
            id,
            name,
            sources,
            total_files: files.len(),
            files,
            status: BulkStatus::Pending,
            downloaded_files: 0,
            failed_files: 0,
            total_size_bytes,
            download_tasks: BTreeMap::new(),
            file_outcomes: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            options,
            errors: Vec::new(),
        }
    }

    /// Handles of transfers that have started but not settled.
    #[must_use]
    pub fn outstanding_tasks(&self) -> Vec<TaskHandle> {
        self.download_tasks
            .iter()
            .filter(|(index, _)| !self.file_outcomes.contains_key(index))
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    /// Settled share in `0.0..=1.0`; an empty job counts as done.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_files == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let progress = (self.downloaded_files + self.failed_files) as f64 / self.total_files as f64;
        progress
    }

    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        #[allow(clippy::cast_precision_loss)]
        let secs = (completed - started).num_milliseconds() as f64 / 1000.0;
        Some(secs)
    }

    pub(crate) fn snapshot_progress(&self) -> JobProgress {
        JobProgress {
            status: self.status,
            total_files: self.total_files,
            downloaded_files: self.downloaded_files,
            failed_files: self.failed_files,
            progress: self.progress(),
        }
    }
}

/// Payload handed to progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JobProgress {
    pub status: BulkStatus,
    pub total_files: usize,
    pub downloaded_files: usize,
    pub failed_files: usize,
    pub progress: f64,
}

/// Per-file entry of a [`JobReport`], with live transfer state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub index: usize,
    pub file: String,
    pub url: String,
    pub task: Option<TaskHandle>,
    pub transfer: Option<TransferStatus>,
    pub outcome: Option<FileOutcome>,
}

/// Snapshot of a job plus live per-task status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub id: String,
    pub name: String,
    pub status: BulkStatus,
    pub total_files: usize,
    pub downloaded_files: usize,
    pub failed_files: usize,
    pub total_size_bytes: u64,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub options: JobOptions,
    pub errors: Vec<String>,
    pub tasks: Vec<TaskReport>,
}

/// Job counts across the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkStatistics {
    pub total: usize,
    pub completed: usize,
    /// Processing or paused.
    pub active: usize,
    /// Pending.
    pub queued: usize,
}
