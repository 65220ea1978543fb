//! File transfer collaborator.
//!
//! The bulk orchestrator only talks to the [`TransferClient`] trait. The
//! shipped implementation, [`HttpTransfer`], streams into a `.part` file,
//! resumes with HTTP Range requests, verifies SHA-256 and renames the file
//! into place once complete.

mod error;
mod http;
mod retry_after;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::TransferError;
pub use http::HttpTransfer;
pub use retry_after::{MAX_RETRY_AFTER, parse_retry_after};

use crate::config::ConfigError;

/// Opaque identifier of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TaskHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    /// Final path; data is staged next to it with a `.part` suffix.
    pub destination: PathBuf,
    /// Published SHA-256, hex encoded.
    pub expected_sha256: Option<String>,
    pub expected_size: Option<u64>,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_sha256: None,
            expected_size: None,
        }
    }

    #[must_use]
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.expected_sha256 = Some(sha256.into());
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Live view of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferStatus {
    pub state: TransferState,
    pub url: String,
    pub destination: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub resumed: bool,
    pub error: Option<String>,
}

impl TransferStatus {
    /// Completed share in `0.0..=1.0`, when the total is known.
    #[must_use]
    pub fn progress(&self) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        let progress = self
            .total_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.bytes_downloaded as f64 / total as f64).min(1.0));
        progress
    }
}

/// A finished transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
    pub resumed: bool,
}

/// Download collaborator driven by the bulk orchestrator.
///
/// `start` only schedules the transfer; `wait` drives it to completion.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Schedules a transfer and returns its handle.
    async fn start(&self, request: TransferRequest) -> Result<TaskHandle, TransferError>;

    /// Waits for a transfer to finish. Each handle can be awaited once.
    async fn wait(&self, handle: &TaskHandle) -> Result<TransferOutcome, TransferError>;

    async fn status(&self, handle: &TaskHandle) -> Option<TransferStatus>;

    /// Returns false for unknown or finished handles.
    async fn pause(&self, handle: &TaskHandle) -> bool;

    async fn resume(&self, handle: &TaskHandle) -> bool;

    async fn cancel(&self, handle: &TaskHandle) -> bool;
}

/// `[transfer]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub connect_timeout_secs: u64,
    /// Longest idle gap between body reads.
    pub read_timeout_secs: u64,
    /// Sent as a bearer token when set.
    pub api_token: Option<String>,
    pub user_agent: String,
    /// Buffer size when no optimizer is attached.
    pub buffer_size: usize,
    /// Finished transfers whose status stays queryable after `wait`.
    pub retain_finished_tasks: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            api_token: None,
            user_agent: concat!("civitai-downloader/", env!("CARGO_PKG_VERSION")).to_string(),
            buffer_size: 1024 * 1024,
            retain_finished_tasks: 1024,
        }
    }
}

impl TransferConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero timeouts or buffer size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid("transfer.connect_timeout_secs", "must be positive"));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::invalid("transfer.read_timeout_secs", "must be positive"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("transfer.buffer_size", "must be positive"));
        }
        Ok(())
    }
}

impl fmt::Display for TransferConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connect={}s read={}s token={} buffer={}B",
            self.connect_timeout_secs,
            self.read_timeout_secs,
            if self.api_token.is_some() { "[redacted]" } else { "none" },
            self.buffer_size
        )
    }
}
