//! Per-operation metrics and the performance report.
//!
//! Counters are monotonic; response times and success outcomes are kept in
//! capped rolling windows. State is partitioned by operation key and stored in
//! a [`DashMap`], so concurrent writers on different keys never contend and
//! writers on the same key serialize on that key's shard.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;
use crate::fault::{ClassifiedFault, FaultCategory};
use crate::retry::{AttemptHistory, RetryAttemptRecord};

/// Thresholds and window sizes for [`MetricsAggregator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Response times kept per key.
    pub response_time_window: usize,
    /// Outcomes kept per key for the rolling success rate.
    pub success_window: usize,
    /// Operations below this success rate are flagged.
    pub low_success_rate: f64,
    /// Operations slower than this on average are flagged.
    pub slow_response_secs: f64,
    /// A single error pattern above this share of all errors is flagged.
    pub dominant_error_share: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            response_time_window: 100,
            success_window: 100,
            low_success_rate: 0.8,
            slow_response_secs: 10.0,
            dominant_error_share: 0.3,
        }
    }
}

impl MetricsConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a window is empty or a ratio is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_time_window == 0 {
            return Err(ConfigError::invalid("metrics.response_time_window", "must be at least 1"));
        }
        if self.success_window == 0 {
            return Err(ConfigError::invalid("metrics.success_window", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.low_success_rate) {
            return Err(ConfigError::invalid("metrics.low_success_rate", "must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.dominant_error_share) {
            return Err(ConfigError::invalid("metrics.dominant_error_share", "must be within 0.0..=1.0"));
        }
        if !self.slow_response_secs.is_finite() || self.slow_response_secs < 0.0 {
            return Err(ConfigError::invalid("metrics.slow_response_secs", "must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OperationMetrics {
    calls: u64,
    successes: u64,
    faults: u64,
    response_times: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
    faults_by_category: HashMap<FaultCategory, u64>,
}

impl OperationMetrics {
    fn push_outcome(&mut self, success: bool, cap: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > cap {
            self.outcomes.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.outcomes.iter().filter(|ok| **ok).count() as f64 / self.outcomes.len() as f64;
        rate
    }

    /// Faults per call over the lifetime of the key.
    fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.faults as f64 / self.calls as f64;
        rate
    }
}

/// Shared metrics store for every retried operation.
#[derive(Debug)]
pub struct MetricsAggregator {
    config: MetricsConfig,
    operations: DashMap<String, OperationMetrics>,
    error_patterns: DashMap<String, u64>,
    total_faults: AtomicU64,
    history: AttemptHistory,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(
            MetricsConfig::default(),
            crate::retry::DEFAULT_HISTORY_CAP,
            crate::retry::DEFAULT_HISTORY_KEEP,
        )
    }
}

impl MetricsAggregator {
    #[must_use]
    pub fn new(config: MetricsConfig, history_cap: usize, history_keep: usize) -> Self {
        Self {
            config,
            operations: DashMap::new(),
            error_patterns: DashMap::new(),
            total_faults: AtomicU64::new(0),
            history: AttemptHistory::new(history_cap, history_keep),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Attempt history shared with the backoff calculator.
    #[must_use]
    pub fn history(&self) -> &AttemptHistory {
        &self.history
    }

    pub fn record_attempt(&self, key: &str, record: RetryAttemptRecord) {
        self.history.record(key, record);
    }

    /// Counts a successful call and its response time.
    pub fn record_success(&self, key: &str, response_time: Duration) {
        let mut entry = self.operations.entry(key.to_string()).or_default();
        entry.calls += 1;
        entry.successes += 1;
        entry.response_times.push_back(response_time);
        while entry.response_times.len() > self.config.response_time_window {
            entry.response_times.pop_front();
        }
        entry.push_outcome(true, self.config.success_window);
    }

    /// Counts a failed call and its error pattern `"{operation}.{fault_name}"`.
    pub fn record_fault(&self, key: &str, fault: &ClassifiedFault<'_>) {
        {
            let mut entry = self.operations.entry(key.to_string()).or_default();
            entry.calls += 1;
            entry.faults += 1;
            *entry.faults_by_category.entry(fault.category()).or_insert(0) += 1;
            entry.push_outcome(false, self.config.success_window);
        }

        let pattern = format!("{}.{}", fault.context().operation(), fault.fault_name());
        *self.error_patterns.entry(pattern).or_insert(0) += 1;
        self.total_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Forgets every counter and the attempt history.
    pub fn clear(&self) {
        self.operations.clear();
        self.error_patterns.clear();
        self.total_faults.store(0, Ordering::Relaxed);
        self.history.clear();
        debug!("metrics cleared");
    }

    /// Builds a point-in-time report.
    #[must_use]
    pub fn report(&self) -> PerformanceReport {
        let mut report = PerformanceReport {
            generated_at: Utc::now(),
            ..PerformanceReport::default()
        };

        for entry in &self.operations {
            let key = entry.key().clone();
            let metrics = entry.value();

            report.api_usage.insert(key.clone(), metrics.calls);
            report.success_rates.insert(key.clone(), metrics.success_rate());
            if let Some(stats) = TimingStatistics::from_window(&metrics.response_times) {
                report.timing_statistics.insert(key.clone(), stats);
            }

            let records = self.history.records(&key);
            let total_retry_delay: f64 = records.iter().map(|r| r.delay.as_secs_f64()).sum();
            report.performance_impact.insert(
                key.clone(),
                PerformanceImpact {
                    total_calls: metrics.calls,
                    successes: metrics.successes,
                    faults: metrics.faults,
                    error_rate: metrics.error_rate(),
                    total_retry_delay,
                    faults_by_category: metrics
                        .faults_by_category
                        .iter()
                        .map(|(category, count)| (category.as_str().to_string(), *count))
                        .collect(),
                },
            );
            if let Some(effectiveness) = RetryEffectiveness::from_records(&records) {
                report.retry_effectiveness.insert(key, effectiveness);
            }
        }

        for entry in &self.error_patterns {
            report.error_patterns.insert(entry.key().clone(), *entry.value());
        }

        report.recommendations = self.recommendations(&report);
        report
    }

    fn recommendations(&self, report: &PerformanceReport) -> Vec<String> {
        let mut out = Vec::new();

        for (key, rate) in &report.success_rates {
            if *rate < self.config.low_success_rate {
                out.push(format!(
                    "{key} has a low success rate ({:.0}%); review its error patterns",
                    rate * 100.0
                ));
            }
        }

        for (key, stats) in &report.timing_statistics {
            if stats.avg_response_time > self.config.slow_response_secs {
                out.push(format!(
                    "{key} averages {:.1}s per call; consider caching or smaller requests",
                    stats.avg_response_time
                ));
            }
        }

        let total = self.total_faults.load(Ordering::Relaxed);
        if total > 0
            && let Some((pattern, count)) = report
                .error_patterns
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        {
            #[allow(clippy::cast_precision_loss)]
            let share = *count as f64 / total as f64;
            if share > self.config.dominant_error_share {
                out.push(format!(
                    "{pattern} accounts for {:.0}% of all errors; investigate it first",
                    share * 100.0
                ));
            }
        }

        out
    }
}

/// Aggregated metrics keyed by operation key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    /// Calls per key, successes and faults combined.
    pub api_usage: BTreeMap<String, u64>,
    /// Success ratio over the rolling outcome window.
    pub success_rates: BTreeMap<String, f64>,
    /// Fault counts keyed by `"{operation}.{fault_name}"`.
    pub error_patterns: BTreeMap<String, u64>,
    pub performance_impact: BTreeMap<String, PerformanceImpact>,
    pub timing_statistics: BTreeMap<String, TimingStatistics>,
    pub retry_effectiveness: BTreeMap<String, RetryEffectiveness>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceImpact {
    pub total_calls: u64,
    pub successes: u64,
    pub faults: u64,
    /// `faults / total_calls`, 0.0 before the first call.
    pub error_rate: f64,
    /// Seconds spent waiting between attempts, over retained history.
    pub total_retry_delay: f64,
    pub faults_by_category: BTreeMap<String, u64>,
}

/// Response-time summary in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStatistics {
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub median_response_time: f64,
    pub count: usize,
}

impl TimingStatistics {
    fn from_window(window: &VecDeque<Duration>) -> Option<Self> {
        if window.is_empty() {
            return None;
        }
        let mut secs: Vec<f64> = window.iter().map(Duration::as_secs_f64).collect();
        secs.sort_by(f64::total_cmp);

        let count = secs.len();
        #[allow(clippy::cast_precision_loss)]
        let avg = secs.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (secs[count / 2 - 1] + secs[count / 2]) / 2.0
        } else {
            secs[count / 2]
        };

        Some(Self {
            avg_response_time: avg,
            min_response_time: secs[0],
            max_response_time: secs[count - 1],
            median_response_time: median,
            count,
        })
    }
}

/// How well retries (attempts after the first) fared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryEffectiveness {
    pub total_retries: usize,
    pub successful_retries: usize,
    pub retry_success_rate: f64,
    /// Mean attempt number of retried calls that eventually succeeded.
    pub avg_attempts_to_success: f64,
}

impl RetryEffectiveness {
    fn from_records(records: &[RetryAttemptRecord]) -> Option<Self> {
        let retries: Vec<&RetryAttemptRecord> = records.iter().filter(|r| r.attempt_number > 1).collect();
        if retries.is_empty() {
            return None;
        }
        let successes: Vec<&&RetryAttemptRecord> = retries.iter().filter(|r| r.success).collect();

        #[allow(clippy::cast_precision_loss)]
        let retry_success_rate = successes.len() as f64 / retries.len() as f64;
        #[allow(clippy::cast_precision_loss)]
        let avg_attempts_to_success = if successes.is_empty() {
            0.0
        } else {
            successes.iter().map(|r| f64::from(r.attempt_number)).sum::<f64>() / successes.len() as f64
        };

        Some(Self {
            total_retries: retries.len(),
            successful_retries: successes.len(),
            retry_success_rate,
            avg_attempts_to_success,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fault::{CivitaiApiError, FaultClassifier, OperationContext};
    use crate::retry::BackoffStrategy;

    #[test]
    fn test_ten_successes_report_full_rate_and_average() {
        let metrics = MetricsAggregator::default();
        for _ in 0..10 {
            metrics.record_success("svc.op", Duration::from_secs(2));
        }

        let report = metrics.report();
        assert!((report.success_rates["svc.op"] - 1.0).abs() < f64::EPSILON);
        let timing = &report.timing_statistics["svc.op"];
        assert!((timing.avg_response_time - 2.0).abs() < 1e-9);
        assert!((timing.median_response_time - 2.0).abs() < 1e-9);
        assert_eq!(timing.count, 10);
        assert_eq!(report.api_usage["svc.op"], 10);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_faults_lower_rate_and_produce_patterns() {
        let metrics = MetricsAggregator::default();
        let classifier = FaultClassifier::new();
        let ctx = OperationContext::new("op", "svc");
        let error = CivitaiApiError::from_status(503, "unavailable", None);

        metrics.record_success("svc.op", Duration::from_millis(100));
        for _ in 0..3 {
            let classified = classifier.wrap(&error, &ctx);
            metrics.record_fault("svc.op", &classified);
        }

        let report = metrics.report();
        assert!((report.success_rates["svc.op"] - 0.25).abs() < 1e-9);
        assert_eq!(report.error_patterns["op.ApiError"], 3);
        let impact = &report.performance_impact["svc.op"];
        assert_eq!(impact.faults_by_category["api"], 3);
        assert_eq!(impact.total_calls, 4);
        assert!((impact.error_rate - 0.75).abs() < 1e-9);
        assert!(report.recommendations.iter().any(|r| r.contains("low success rate")));
        assert!(report.recommendations.iter().any(|r| r.contains("op.ApiError")));
    }

    #[test]
    fn test_slow_operations_are_flagged() {
        let metrics = MetricsAggregator::default();
        metrics.record_success("svc.slow", Duration::from_secs(12));
        let report = metrics.report();
        assert!(report.recommendations.iter().any(|r| r.starts_with("svc.slow averages")));
    }

    #[test]
    fn test_timing_window_is_capped() {
        let config = MetricsConfig {
            response_time_window: 3,
            ..MetricsConfig::default()
        };
        let metrics = MetricsAggregator::new(config, 100, 50);
        for secs in [10, 1, 2, 3] {
            metrics.record_success("svc.op", Duration::from_secs(secs));
        }
        let timing = &metrics.report().timing_statistics["svc.op"];
        assert_eq!(timing.count, 3);
        assert!((timing.max_response_time - 3.0).abs() < 1e-9);
        assert!((timing.avg_response_time - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_retry_effectiveness_ignores_first_attempts() {
        let metrics = MetricsAggregator::default();
        let strategy = BackoffStrategy::Exponential;
        metrics.record_attempt("svc.op", RetryAttemptRecord::success(1, Duration::ZERO, strategy));
        metrics.record_attempt(
            "svc.op",
            RetryAttemptRecord::failure(1, Duration::from_secs(1), "HttpError", Duration::ZERO, strategy),
        );
        metrics.record_attempt(
            "svc.op",
            RetryAttemptRecord::failure(2, Duration::from_secs(2), "HttpError", Duration::ZERO, strategy),
        );
        metrics.record_attempt("svc.op", RetryAttemptRecord::success(3, Duration::ZERO, strategy));
        metrics.record_success("svc.op", Duration::ZERO);

        let report = metrics.report();
        let effectiveness = &report.retry_effectiveness["svc.op"];
        assert_eq!(effectiveness.total_retries, 2);
        assert_eq!(effectiveness.successful_retries, 1);
        assert!((effectiveness.retry_success_rate - 0.5).abs() < 1e-9);
        assert!((effectiveness.avg_attempts_to_success - 3.0).abs() < 1e-9);
        assert!((report.performance_impact["svc.op"].total_retry_delay - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_clear_resets_everything() {
        let metrics = MetricsAggregator::default();
        metrics.record_success("svc.op", Duration::from_secs(1));
        metrics.clear();
        let report = metrics.report();
        assert!(report.api_usage.is_empty());
        assert!(metrics.history().is_empty());
    }
}
