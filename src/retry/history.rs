//! Per-operation-key attempt history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::backoff::BackoffStrategy;
use crate::fault::duration_secs;

/// Default number of records kept per key before trimming.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Number of most recent records kept after trimming.
pub const DEFAULT_HISTORY_KEEP: usize = 50;

/// Outcome label stored for successful attempts.
pub const SUCCESS_OUTCOME: &str = "success";

/// One attempt of a retried operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttemptRecord {
    /// 1-based attempt number within one orchestrator invocation.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    /// Delay waited after this attempt before the next one (zero on success).
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// Fault name, or `"success"`.
    pub outcome: String,
    pub success: bool,
    #[serde(with = "duration_secs")]
    pub response_time: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryAttemptRecord {
    #[must_use]
    pub fn success(attempt_number: u32, response_time: Duration, strategy: BackoffStrategy) -> Self {
        Self {
            attempt_number,
            timestamp: Utc::now(),
            delay: Duration::ZERO,
            outcome: SUCCESS_OUTCOME.to_string(),
            success: true,
            response_time,
            strategy,
        }
    }

    #[must_use]
    pub fn failure(
        attempt_number: u32,
        delay: Duration,
        fault_name: &str,
        response_time: Duration,
        strategy: BackoffStrategy,
    ) -> Self {
        Self {
            attempt_number,
            timestamp: Utc::now(),
            delay,
            outcome: fault_name.to_string(),
            success: false,
            response_time,
            strategy,
        }
    }
}

/// Append-only attempt log partitioned by operation key.
///
/// Each key holds at most `cap` records; when the cap is exceeded the oldest
/// records are dropped until `keep` remain. Concurrent invocations sharing a
/// key interleave their records.
#[derive(Debug)]
pub struct AttemptHistory {
    records: DashMap<String, VecDeque<RetryAttemptRecord>>,
    cap: usize,
    keep: usize,
}

impl Default for AttemptHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP, DEFAULT_HISTORY_KEEP)
    }
}

impl AttemptHistory {
    /// Creates a history store. `keep` is clamped to `1..=cap`.
    #[must_use]
    pub fn new(cap: usize, keep: usize) -> Self {
        let cap = cap.max(1);
        Self {
            records: DashMap::new(),
            cap,
            keep: keep.clamp(1, cap),
        }
    }

    /// Appends a record for `key`, trimming old entries past the cap.
    pub fn record(&self, key: &str, record: RetryAttemptRecord) {
        let mut entry = self.records.entry(key.to_string()).or_default();
        entry.push_back(record);
        if entry.len() > self.cap {
            let excess = entry.len() - self.keep;
            entry.drain(..excess);
        }
    }

    /// Number of records currently stored for `key`.
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.records.get(key).map_or(0, |records| records.len())
    }

    /// True when no key has any record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|entry| entry.value().is_empty())
    }

    /// The last `limit` records for `key`, oldest first.
    #[must_use]
    pub fn recent(&self, key: &str, limit: usize) -> Vec<RetryAttemptRecord> {
        self.records.get(key).map_or_else(Vec::new, |records| {
            let skip = records.len().saturating_sub(limit);
            records.iter().skip(skip).cloned().collect()
        })
    }

    /// All stored records for `key`, oldest first.
    #[must_use]
    pub fn records(&self, key: &str) -> Vec<RetryAttemptRecord> {
        self.recent(key, usize::MAX)
    }

    /// Keys with at least one record, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Drops all history.
    pub fn clear(&self) {
        self.records.clear();
    }
}
