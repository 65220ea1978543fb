//! Adaptive tuning of download concurrency and chunk size.
//!
//! The optimizer owns two tunables, connection count and chunk size, and
//! adjusts them once per cycle from three signals: throughput samples, CPU
//! and memory. The tunables live in atomics so readers never wait on an
//! adjustment.
//!
//! | CPU / memory | Network | Connections | Chunk size |
//! |--------------|---------|-------------|------------|
//! | both high | unstable | halve toward min | min |
//! | either high | any | -1 | halve |
//! | both low | good / excellent | +1 | double |
//! | both low | unstable | hold | halve |
//! | both low | poor | -1 | hold |
//! | both low | fair | hold | hold |

mod config;
mod monitor;
mod network;
mod resources;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

pub use config::{OptimizationMode, OptimizerConfig};
pub use monitor::MonitorHandle;
pub use network::{NetworkCondition, SpeedThresholds, SpeedWindow};
pub use resources::{ProcfsSampler, ResourceSample, ResourceSampler};

/// Jitter applied to [`PerformanceOptimizer::retry_delay`], as a fraction.
const RETRY_JITTER: f64 = 0.1;

/// What a cycle did to the tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    Hold,
    ScaleUp,
    ScaleDown,
    /// High CPU, high memory and an unstable network at once.
    Collapse,
    ShrinkChunks,
    ReduceConnections,
}

/// Result of one adjustment cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub condition: NetworkCondition,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub adjustment: Adjustment,
    pub connections: usize,
    pub chunk_size: usize,
}

#[derive(Debug)]
struct Signals {
    speeds: SpeedWindow,
    condition: NetworkCondition,
    last_sample: ResourceSample,
    last_adjusted: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ConnectionEntry {
    registered_at: DateTime<Utc>,
    errors: u64,
}

/// Live optimizer state. Share it behind an `Arc`.
#[derive(Debug)]
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    connections: AtomicUsize,
    chunk_size: AtomicUsize,
    signals: Mutex<Signals>,
    active: DashMap<String, ConnectionEntry>,
    registered_total: AtomicU64,
    connection_errors: AtomicU64,
    bytes_transferred: AtomicU64,
}

impl Default for PerformanceOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl PerformanceOptimizer {
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        let (min_connections, max_connections) = config.connection_bounds();
        let (min_chunk, max_chunk) = config.chunk_bounds();
        let connections = config.initial_connections.clamp(min_connections, max_connections);
        let chunk_size = config.initial_chunk_size.clamp(min_chunk, max_chunk);

        Self {
            signals: Mutex::new(Signals {
                speeds: SpeedWindow::new(config.speed_window),
                condition: NetworkCondition::Fair,
                last_sample: ResourceSample::default(),
                last_adjusted: None,
            }),
            connections: AtomicUsize::new(connections),
            chunk_size: AtomicUsize::new(chunk_size),
            active: DashMap::new(),
            registered_total: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Live tuned connection count, regardless of mode.
    #[must_use]
    pub fn current_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Live tuned chunk size in bytes, regardless of mode.
    #[must_use]
    pub fn current_chunk_size(&self) -> usize {
        self.chunk_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn network_condition(&self) -> NetworkCondition {
        self.signals().condition
    }

    /// Connection count to use for the next batch.
    #[must_use]
    pub fn optimal_connections(&self) -> usize {
        let (min, max) = self.config.connection_bounds();
        match self.config.mode {
            OptimizationMode::Speed => max,
            OptimizationMode::Minimal => min,
            OptimizationMode::Efficiency => (max / 2).max(min),
            OptimizationMode::Adaptive => self.current_connections(),
        }
    }

    /// Read buffer size to use for the next transfer.
    #[must_use]
    pub fn optimal_chunk_size(&self) -> usize {
        let (min, max) = self.config.chunk_bounds();
        match self.config.mode {
            OptimizationMode::Speed => max,
            OptimizationMode::Minimal => min,
            OptimizationMode::Efficiency => (max / 2).max(min),
            OptimizationMode::Adaptive => self.current_chunk_size(),
        }
    }

    /// Adds a throughput sample in bytes per second.
    pub fn record_speed_sample(&self, bytes_per_sec: f64) {
        self.signals().speeds.push(bytes_per_sec);
    }

    /// Adds a sample derived from a finished transfer.
    pub fn record_transfer(&self, bytes: u64, elapsed: Duration) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            self.record_speed_sample(bytes as f64 / secs);
        }
    }

    /// Network-aware delay before retry `attempt` (1-based).
    ///
    /// `base * 2^attempt`, with `base` between 0.5s and 2.0s depending on the
    /// network, +/-10% jitter, capped at the configured maximum.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = if self.config.adaptive_retry {
            self.network_condition().retry_base_secs()
        } else {
            NetworkCondition::Good.retry_base_secs()
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let jitter = rand::thread_rng().gen_range(1.0 - RETRY_JITTER..=1.0 + RETRY_JITTER);
        let secs = (base * 2f64.powi(exponent) * jitter).min(self.config.max_retry_delay_secs);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(self.config.max_retry_delay())
    }

    /// Samples resources and adjusts the tunables once.
    ///
    /// A failed sample skips the cycle.
    pub fn run_adjustment_cycle(&self, sampler: &dyn ResourceSampler) -> Option<CycleOutcome> {
        match sampler.sample() {
            Ok(sample) => Some(self.apply_cycle(sample)),
            Err(error) => {
                debug!(%error, "resource sample unavailable; skipping adjustment");
                None
            }
        }
    }

    /// Adjusts the tunables for a given resource reading.
    pub fn apply_cycle(&self, sample: ResourceSample) -> CycleOutcome {
        let cfg = &self.config;
        let condition = {
            let mut signals = self.signals();
            signals.condition = signals.speeds.classify(&cfg.speed_thresholds());
            signals.last_sample = sample;
            signals.last_adjusted = Some(Utc::now());
            signals.condition
        };

        let high_cpu = sample.cpu_percent > cfg.cpu_threshold;
        let high_memory = sample.memory_percent > cfg.memory_threshold;
        let connections = self.current_connections();
        let chunk = self.current_chunk_size();

        let (adjustment, next_connections, next_chunk) =
            if high_cpu && high_memory && condition == NetworkCondition::Unstable {
                (Adjustment::Collapse, connections / 2, cfg.min_chunk_size)
            } else if high_cpu || high_memory {
                (Adjustment::ScaleDown, connections.saturating_sub(1), chunk / 2)
            } else if condition.is_healthy() {
                (
                    Adjustment::ScaleUp,
                    connections.saturating_add(1),
                    chunk.saturating_mul(2),
                )
            } else if condition == NetworkCondition::Unstable {
                (Adjustment::ShrinkChunks, connections, chunk / 2)
            } else if condition == NetworkCondition::Poor {
                (Adjustment::ReduceConnections, connections.saturating_sub(1), chunk)
            } else {
                (Adjustment::Hold, connections, chunk)
            };

        let (min_connections, max_connections) = cfg.connection_bounds();
        let (min_chunk, max_chunk) = cfg.chunk_bounds();
        let next_connections = next_connections.clamp(min_connections, max_connections);
        let next_chunk = next_chunk.clamp(min_chunk, max_chunk);

        self.connections.store(next_connections, Ordering::Release);
        self.chunk_size.store(next_chunk, Ordering::Release);

        if next_connections == connections && next_chunk == chunk {
            debug!(%condition, cpu = sample.cpu_percent, memory = sample.memory_percent, "optimizer holding");
        } else {
            info!(
                %condition,
                ?adjustment,
                connections = next_connections,
                chunk_size = next_chunk,
                "optimizer adjusted"
            );
        }

        CycleOutcome {
            condition,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            adjustment,
            connections: next_connections,
            chunk_size: next_chunk,
        }
    }

    /// Runs adjustment cycles in the background until the handle is stopped.
    #[must_use]
    pub fn start_monitoring(self: &Arc<Self>, sampler: Arc<dyn ResourceSampler>) -> MonitorHandle {
        info!(
            interval_secs = self.config.adjustment_interval_secs,
            mode = ?self.config.mode,
            "starting optimizer monitor"
        );
        monitor::spawn(Arc::clone(self), sampler)
    }

    /// Tracks an open connection under an opaque handle.
    pub fn register_connection(&self, handle: &str) {
        self.active.insert(
            handle.to_string(),
            ConnectionEntry {
                registered_at: Utc::now(),
                errors: 0,
            },
        );
        self.registered_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unregister_connection(&self, handle: &str) {
        if let Some((_, entry)) = self.active.remove(handle) {
            let open_for = Utc::now() - entry.registered_at;
            debug!(handle, errors = entry.errors, open_ms = open_for.num_milliseconds(), "connection released");
        }
    }

    /// Counts a failure on a connection, registered or not.
    pub fn record_connection_error(&self, handle: &str) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(mut entry) = self.active.get_mut(handle) {
            entry.errors += 1;
        } else {
            warn!(handle, "error recorded for unknown connection");
        }
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.len()
    }

    /// Current metrics, configuration and recommendations.
    #[must_use]
    pub fn performance_report(&self) -> OptimizerReport {
        let (condition, average, peak, samples, sample, last_adjusted) = {
            let signals = self.signals();
            (
                signals.condition,
                signals.speeds.average(),
                signals.speeds.peak(),
                signals.speeds.len(),
                signals.last_sample,
                signals.last_adjusted,
            )
        };

        let registered = self.registered_total.load(Ordering::Relaxed);
        let errors = self.connection_errors.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let failure_rate = if registered == 0 {
            0.0
        } else {
            errors as f64 / registered as f64
        };

        let mut recommendations = Vec::new();
        if matches!(condition, NetworkCondition::Poor | NetworkCondition::Unstable) {
            recommendations.push(format!(
                "Network is {condition}; fewer parallel downloads may be more reliable"
            ));
        }
        if sample.cpu_percent > self.config.cpu_threshold {
            recommendations.push(format!(
                "CPU usage is high ({:.0}%); consider the efficiency or minimal mode",
                sample.cpu_percent
            ));
        }
        if sample.memory_percent > self.config.memory_threshold {
            recommendations.push(format!(
                "Memory usage is high ({:.0}%); smaller chunks reduce buffering",
                sample.memory_percent
            ));
        }
        if failure_rate > self.config.connection_failure_rate {
            recommendations.push(format!(
                "{:.0}% of connections failed; check connectivity or lower concurrency",
                failure_rate * 100.0
            ));
        }

        OptimizerReport {
            generated_at: Utc::now(),
            mode: self.config.mode,
            network_condition: condition,
            average_speed: average,
            peak_speed: peak,
            speed_samples: samples,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            current_connections: self.current_connections(),
            current_chunk_size: self.current_chunk_size(),
            optimal_connections: self.optimal_connections(),
            optimal_chunk_size: self.optimal_chunk_size(),
            active_connections: self.active_connections(),
            registered_connections: registered,
            connection_errors: errors,
            connection_failure_rate: failure_rate,
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            last_adjusted,
            config: self.config.clone(),
            recommendations,
        }
    }

    fn signals(&self) -> std::sync::MutexGuard<'_, Signals> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Snapshot returned by [`PerformanceOptimizer::performance_report`].
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerReport {
    pub generated_at: DateTime<Utc>,
    pub mode: OptimizationMode,
    pub network_condition: NetworkCondition,
    /// Bytes per second.
    pub average_speed: f64,
    pub peak_speed: f64,
    pub speed_samples: usize,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub current_connections: usize,
    pub current_chunk_size: usize,
    pub optimal_connections: usize,
    pub optimal_chunk_size: usize,
    pub active_connections: usize,
    pub registered_connections: u64,
    pub connection_errors: u64,
    pub connection_failure_rate: f64,
    pub bytes_transferred: u64,
    pub last_adjusted: Option<DateTime<Utc>>,
    pub config: OptimizerConfig,
    pub recommendations: Vec<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MB: f64 = 1024.0 * 1024.0;

    fn calm() -> ResourceSample {
        ResourceSample {
            cpu_percent: 20.0,
            memory_percent: 30.0,
        }
    }

    #[test]
    fn test_healthy_network_scales_up_to_bounds() {
        let optimizer = PerformanceOptimizer::default();
        for _ in 0..5 {
            optimizer.record_speed_sample(12.0 * MB);
        }
        for _ in 0..20 {
            let outcome = optimizer.apply_cycle(calm());
            assert_eq!(outcome.condition, NetworkCondition::Excellent);
        }
        assert_eq!(optimizer.current_connections(), 8);
        assert_eq!(optimizer.current_chunk_size(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_high_cpu_scales_down() {
        let optimizer = PerformanceOptimizer::default();
        let outcome = optimizer.apply_cycle(ResourceSample {
            cpu_percent: 95.0,
            memory_percent: 10.0,
        });
        assert_eq!(outcome.adjustment, Adjustment::ScaleDown);
        assert_eq!(outcome.connections, 2);
        assert_eq!(outcome.chunk_size, 512 * 1024);
    }

    #[test]
    fn test_fair_network_holds() {
        let optimizer = PerformanceOptimizer::default();
        for _ in 0..5 {
            optimizer.record_speed_sample(2.0 * MB);
        }
        let outcome = optimizer.apply_cycle(calm());
        assert_eq!(outcome.adjustment, Adjustment::Hold);
        assert_eq!(outcome.connections, 3);
    }

    #[test]
    fn test_inverted_bounds_pin_values_to_minimum() {
        let config = OptimizerConfig {
            min_connections: 6,
            max_connections: 2,
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 64 * 1024,
            ..OptimizerConfig::default()
        };
        let optimizer = PerformanceOptimizer::new(config);

        let readings = [(10.0, 10.0), (95.0, 10.0), (95.0, 95.0)];
        for speed in [12.0 * MB, 0.1 * MB] {
            optimizer.record_speed_sample(speed);
            for (cpu_percent, memory_percent) in readings {
                let outcome = optimizer.apply_cycle(ResourceSample {
                    cpu_percent,
                    memory_percent,
                });
                assert_eq!(outcome.connections, 6);
                assert_eq!(outcome.chunk_size, 1024 * 1024);
            }
        }
    }

    #[test]
    fn test_mode_dependent_values() {
        let config = |mode| OptimizerConfig {
            mode,
            ..OptimizerConfig::default()
        };
        assert_eq!(PerformanceOptimizer::new(config(OptimizationMode::Speed)).optimal_connections(), 8);
        assert_eq!(PerformanceOptimizer::new(config(OptimizationMode::Minimal)).optimal_connections(), 1);
        assert_eq!(PerformanceOptimizer::new(config(OptimizationMode::Efficiency)).optimal_connections(), 4);
        assert_eq!(
            PerformanceOptimizer::new(config(OptimizationMode::Efficiency)).optimal_chunk_size(),
            4 * 1024 * 1024
        );
        assert_eq!(PerformanceOptimizer::new(config(OptimizationMode::Adaptive)).optimal_connections(), 3);
    }

    #[test]
    fn test_retry_delay_grows_with_jitter_and_cap() {
        let optimizer = PerformanceOptimizer::default();
        // fair network: base 1.5s
        let first = optimizer.retry_delay(1).as_secs_f64();
        assert!((2.7..=3.3).contains(&first), "{first}");
        let capped = optimizer.retry_delay(20);
        assert!(capped <= Duration::from_secs(60));
    }

    #[test]
    fn test_connection_tracking_and_report() {
        let optimizer = PerformanceOptimizer::default();
        optimizer.register_connection("a");
        optimizer.register_connection("b");
        optimizer.record_connection_error("a");
        assert_eq!(optimizer.active_connections(), 2);
        optimizer.unregister_connection("a");
        assert_eq!(optimizer.active_connections(), 1);

        let report = optimizer.performance_report();
        assert_eq!(report.registered_connections, 2);
        assert_eq!(report.connection_errors, 1);
        assert!(report.recommendations.iter().any(|r| r.contains("connections failed")));
    }

    #[test]
    fn test_record_transfer_feeds_speed_window() {
        let optimizer = PerformanceOptimizer::default();
        optimizer.record_transfer(20 * 1024 * 1024, Duration::from_secs(1));
        optimizer.apply_cycle(calm());
        assert_eq!(optimizer.network_condition(), NetworkCondition::Excellent);
        assert_eq!(optimizer.performance_report().bytes_transferred, 20 * 1024 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_runs_cycles_until_stopped() {
        struct Busy;
        impl ResourceSampler for Busy {
            fn sample(&self) -> std::io::Result<ResourceSample> {
                Ok(ResourceSample {
                    cpu_percent: 99.0,
                    memory_percent: 10.0,
                })
            }
        }

        let optimizer = Arc::new(PerformanceOptimizer::default());
        let handle = optimizer.start_monitoring(Arc::new(Busy));
        tokio::time::sleep(Duration::from_secs(11)).await;
        handle.stop().await;
        assert_eq!(optimizer.current_connections(), 1);
    }
}
