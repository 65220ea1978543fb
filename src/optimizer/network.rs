//! Throughput sampling and network classification.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Samples needed before volatility can mark the network unstable.
const MIN_VOLATILITY_SAMPLES: usize = 3;

/// Live classification of download throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkCondition {
    Excellent,
    Good,
    Fair,
    Poor,
    Unstable,
}

impl NetworkCondition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unstable => "unstable",
        }
    }

    /// Multiplier applied to network-fault backoff delays.
    #[must_use]
    pub fn backoff_scale(self) -> f64 {
        match self {
            Self::Excellent => 0.75,
            Self::Good | Self::Fair => 1.0,
            Self::Poor | Self::Unstable => 1.5,
        }
    }

    /// Base of the optimizer's own retry delay, in seconds.
    #[must_use]
    pub fn retry_base_secs(self) -> f64 {
        match self {
            Self::Excellent => 0.5,
            Self::Good => 1.0,
            Self::Fair => 1.5,
            Self::Poor | Self::Unstable => 2.0,
        }
    }

    /// True for conditions that allow scaling up.
    #[must_use]
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Excellent | Self::Good)
    }
}

impl fmt::Display for NetworkCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speed cutoffs in MB/s plus the volatility limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedThresholds {
    pub excellent_mbps: f64,
    pub good_mbps: f64,
    pub fair_mbps: f64,
    /// Coefficient of variation above which the network is unstable.
    pub volatility: f64,
}

/// Rolling window of throughput samples in bytes per second.
#[derive(Debug, Clone)]
pub struct SpeedWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl SpeedWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Adds a sample; negative or non-finite values are ignored.
    pub fn push(&mut self, bytes_per_sec: f64) {
        if !bytes_per_sec.is_finite() || bytes_per_sec < 0.0 {
            return;
        }
        self.samples.push_back(bytes_per_sec);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        mean
    }

    #[must_use]
    pub fn peak(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    /// Standard deviation divided by the mean; zero when undefined.
    #[must_use]
    pub fn coefficient_of_variation(&self) -> f64 {
        let mean = self.average();
        if self.samples.len() < 2 || mean <= 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let variance = self.samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / self.samples.len() as f64;
        variance.sqrt() / mean
    }

    /// Classifies the window. An empty window reads as fair.
    #[must_use]
    pub fn classify(&self, thresholds: &SpeedThresholds) -> NetworkCondition {
        if self.samples.is_empty() {
            return NetworkCondition::Fair;
        }
        if self.samples.len() >= MIN_VOLATILITY_SAMPLES
            && self.coefficient_of_variation() > thresholds.volatility
        {
            return NetworkCondition::Unstable;
        }

        let mbps = self.average() / BYTES_PER_MB;
        if mbps > thresholds.excellent_mbps {
            NetworkCondition::Excellent
        } else if mbps >= thresholds.good_mbps {
            NetworkCondition::Good
        } else if mbps >= thresholds.fair_mbps {
            NetworkCondition::Fair
        } else {
            NetworkCondition::Poor
        }
    }
}
