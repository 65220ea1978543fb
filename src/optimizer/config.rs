//! `[optimizer]` configuration section.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::network::SpeedThresholds;
use crate::config::ConfigError;

/// How [`PerformanceOptimizer`](super::PerformanceOptimizer) picks its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMode {
    /// Always the configured maximum.
    Speed,
    /// Half of the maximum.
    Efficiency,
    /// Always the configured minimum.
    Minimal,
    /// The live tuned value.
    #[default]
    Adaptive,
}

impl std::str::FromStr for OptimizationMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "speed" => Ok(Self::Speed),
            "efficiency" => Ok(Self::Efficiency),
            "minimal" => Ok(Self::Minimal),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown optimization mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub mode: OptimizationMode,
    pub min_connections: usize,
    pub max_connections: usize,
    pub initial_connections: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub initial_chunk_size: usize,
    /// CPU percent above which the optimizer backs off.
    pub cpu_threshold: f64,
    /// Memory percent above which the optimizer backs off.
    pub memory_threshold: f64,
    pub adjustment_interval_secs: f64,
    /// Throughput samples kept for classification.
    pub speed_window: usize,
    pub volatility_threshold: f64,
    pub excellent_speed_mbps: f64,
    pub good_speed_mbps: f64,
    pub fair_speed_mbps: f64,
    /// Scale retry delays by network condition.
    pub adaptive_retry: bool,
    pub max_retry_delay_secs: f64,
    /// Connection failure share above which a recommendation is emitted.
    pub connection_failure_rate: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            mode: OptimizationMode::Adaptive,
            min_connections: 1,
            max_connections: 8,
            initial_connections: 3,
            min_chunk_size: 64 * 1024,
            max_chunk_size: 8 * 1024 * 1024,
            initial_chunk_size: 1024 * 1024,
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
            adjustment_interval_secs: 5.0,
            speed_window: 20,
            volatility_threshold: 0.5,
            excellent_speed_mbps: 10.0,
            good_speed_mbps: 5.0,
            fair_speed_mbps: 1.0,
            adaptive_retry: true,
            max_retry_delay_secs: 60.0,
            connection_failure_rate: 0.1,
        }
    }
}

impl OptimizerConfig {
    /// `(min, max)` connections; an inverted range collapses to `min`.
    #[must_use]
    pub fn connection_bounds(&self) -> (usize, usize) {
        (self.min_connections, self.max_connections.max(self.min_connections))
    }

    /// `(min, max)` chunk size; an inverted range collapses to `min`.
    #[must_use]
    pub fn chunk_bounds(&self) -> (usize, usize) {
        (self.min_chunk_size, self.max_chunk_size.max(self.min_chunk_size))
    }

    #[must_use]
    pub fn adjustment_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.adjustment_interval_secs).unwrap_or(Duration::from_secs(5))
    }

    #[must_use]
    pub fn max_retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_retry_delay_secs).unwrap_or(Duration::from_secs(60))
    }

    #[must_use]
    pub fn speed_thresholds(&self) -> SpeedThresholds {
        SpeedThresholds {
            excellent_mbps: self.excellent_speed_mbps,
            good_mbps: self.good_speed_mbps,
            fair_mbps: self.fair_speed_mbps,
            volatility: self.volatility_threshold,
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for empty or inverted bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections == 0 || self.min_connections > self.max_connections {
            return Err(ConfigError::invalid(
                "optimizer.min_connections",
                "must be at least 1 and not above max_connections",
            ));
        }
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            return Err(ConfigError::invalid(
                "optimizer.min_chunk_size",
                "must be at least 1 and not above max_chunk_size",
            ));
        }
        if !(self.adjustment_interval_secs.is_finite() && self.adjustment_interval_secs > 0.0) {
            return Err(ConfigError::invalid("optimizer.adjustment_interval_secs", "must be positive"));
        }
        if self.speed_window == 0 {
            return Err(ConfigError::invalid("optimizer.speed_window", "must be at least 1"));
        }
        if !(self.fair_speed_mbps <= self.good_speed_mbps && self.good_speed_mbps <= self.excellent_speed_mbps) {
            return Err(ConfigError::invalid(
                "optimizer.good_speed_mbps",
                "speed thresholds must satisfy fair <= good <= excellent",
            ));
        }
        Ok(())
    }
}
