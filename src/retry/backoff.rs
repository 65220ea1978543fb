//! Backoff delay calculation.
//!
//! All strategies share the same post-processing:
//!
//! ```text
//! delay = clamp(strategy(attempt) * network_scale, 0, max_delay)
//! delay = max(delay, retry_after)          // when the fault carries one
//! delay = max(delay, rate_limit_floor)     // rate-limit faults only
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::config::{AdaptiveBackoffConfig, RetryConfig};
use super::history::RetryAttemptRecord;
use crate::fault::{ClassifiedFault, FaultCategory, RecoveryPolicy};
use crate::optimizer::NetworkCondition;

/// Lower bound of the jitter factor for [`BackoffStrategy::Jittered`].
const JITTER_LOW: f64 = 0.5;

/// Upper bound of the jitter factor for [`BackoffStrategy::Jittered`].
const JITTER_HIGH: f64 = 1.5;

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `initial * multiplier^(attempt-1)`
    #[default]
    Exponential,
    /// `initial * attempt`
    Linear,
    /// `initial * fib(attempt+1)`
    Fibonacci,
    /// Exponential scaled by a uniform factor in `[0.5, 1.5]`.
    Jittered,
    /// Exponential scaled by recent success rate and response times.
    Adaptive,
}

impl BackoffStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fibonacci => "fibonacci",
            Self::Jittered => "jittered",
            Self::Adaptive => "adaptive",
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fibonacci" => Ok(Self::Fibonacci),
            "jittered" => Ok(Self::Jittered),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Everything one delay computation depends on.
#[derive(Debug, Clone, Copy)]
pub struct BackoffInput<'h> {
    pub category: FaultCategory,
    pub policy: &'h RecoveryPolicy,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub strategy: BackoffStrategy,
    /// Recent attempt records for the operation key, oldest first.
    pub history: &'h [RetryAttemptRecord],
    /// Server-mandated delay carried by the fault.
    pub retry_after: Option<Duration>,
    /// Live network classification, if an optimizer is attached.
    pub network: Option<NetworkCondition>,
}

/// Computes the wait before the next attempt.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    adaptive: AdaptiveBackoffConfig,
    rate_limit_floor: Duration,
    max_retry_after: Duration,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl BackoffCalculator {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            adaptive: config.adaptive.clone(),
            rate_limit_floor: config.rate_limit_floor(),
            max_retry_after: config.max_retry_after(),
        }
    }

    /// Minimum delay applied to rate-limit faults.
    #[must_use]
    pub fn rate_limit_floor(&self) -> Duration {
        self.rate_limit_floor
    }

    /// Adaptive parameters, including the history window size.
    #[must_use]
    pub fn adaptive_config(&self) -> &AdaptiveBackoffConfig {
        &self.adaptive
    }

    /// Delay for a classified fault using the thread-local RNG for jitter.
    #[must_use]
    pub fn delay(
        &self,
        fault: &ClassifiedFault<'_>,
        attempt: u32,
        strategy: BackoffStrategy,
        history: &[RetryAttemptRecord],
        network: Option<NetworkCondition>,
    ) -> Duration {
        let input = BackoffInput {
            category: fault.category(),
            policy: fault.policy(),
            attempt,
            strategy,
            history,
            retry_after: fault.source().retry_after(),
            network,
        };
        self.compute(&input, &mut rand::thread_rng())
    }

    /// Pure delay computation; randomness only comes from `rng`.
    pub fn compute<R: Rng + ?Sized>(&self, input: &BackoffInput<'_>, rng: &mut R) -> Duration {
        let policy = input.policy;
        let attempt = input.attempt.max(1);
        let initial = policy.initial_delay.as_secs_f64();
        let max = policy.max_delay.as_secs_f64();
        let exponential = exponential_secs(initial, policy.backoff_multiplier, attempt);

        let raw = match input.strategy {
            BackoffStrategy::Exponential => exponential,
            BackoffStrategy::Linear => initial * f64::from(attempt),
            BackoffStrategy::Fibonacci => initial * fibonacci(attempt + 1),
            BackoffStrategy::Jittered if policy.jitter => {
                exponential * rng.gen_range(JITTER_LOW..=JITTER_HIGH)
            }
            BackoffStrategy::Jittered => exponential,
            BackoffStrategy::Adaptive => exponential * self.adaptive_factor(input.history),
        };

        let scaled = if input.category == FaultCategory::Network {
            raw * input.network.map_or(1.0, NetworkCondition::backoff_scale)
        } else {
            raw
        };

        let mut delay = clamp_secs(scaled, max);

        if let Some(retry_after) = input.retry_after {
            delay = delay.max(retry_after.min(self.max_retry_after));
        }

        if input.category == FaultCategory::RateLimit {
            delay = delay.max(self.rate_limit_floor);
        }

        delay
    }

    /// Multiplier applied to the exponential base by the adaptive strategy.
    ///
    /// Returns 1.0 until `min_history` records exist.
    #[must_use]
    pub fn adaptive_factor(&self, history: &[RetryAttemptRecord]) -> f64 {
        let cfg = &self.adaptive;
        if history.len() < cfg.min_history {
            return 1.0;
        }

        let window = &history[history.len().saturating_sub(cfg.window)..];
        #[allow(clippy::cast_precision_loss)]
        let success_rate = window.iter().filter(|r| r.success).count() as f64 / window.len() as f64;

        let mut factor = if success_rate > cfg.high_success_rate {
            cfg.high_success_factor
        } else if success_rate > cfg.medium_success_rate {
            cfg.medium_success_factor
        } else {
            cfg.low_success_factor
        };

        let successful: Vec<f64> = window
            .iter()
            .filter(|r| r.success)
            .map(|r| r.response_time.as_secs_f64())
            .collect();
        if !successful.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let mean = successful.iter().sum::<f64>() / successful.len() as f64;
            if mean > cfg.slow_response_secs {
                factor *= cfg.slow_response_factor;
            }
        }

        factor
    }
}

fn exponential_secs(initial: f64, multiplier: f64, attempt: u32) -> f64 {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    initial * multiplier.powi(exponent)
}

/// `fib(0) = 0`, `fib(1) = 1`; computed in floating point so large inputs saturate to infinity.
fn fibonacci(n: u32) -> f64 {
    let (mut previous, mut current) = (0.0_f64, 1.0_f64);
    if n == 0 {
        return 0.0;
    }
    for _ in 1..n {
        let next = previous + current;
        previous = current;
        current = next;
        if current.is_infinite() {
            break;
        }
    }
    current
}

fn clamp_secs(secs: f64, max_secs: f64) -> Duration {
    let bounded = if secs.is_nan() { max_secs } else { secs.clamp(0.0, max_secs.max(0.0)) };
    Duration::try_from_secs_f64(bounded).unwrap_or(Duration::ZERO)
}
