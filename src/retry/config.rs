//! `[retry]` configuration section.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::BackoffStrategy;
use super::history::{DEFAULT_HISTORY_CAP, DEFAULT_HISTORY_KEEP};
use crate::config::ConfigError;
use crate::fault::{FaultCategory, RecoveryPolicy};

/// Minimum delay for rate-limit faults, in seconds.
pub const DEFAULT_RATE_LIMIT_FLOOR_SECS: f64 = 5.0;

/// Longest server-mandated Retry-After honored (1 hour).
pub const DEFAULT_MAX_RETRY_AFTER_SECS: f64 = 3600.0;

/// Retry orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Strategy used when the caller does not pick one.
    pub default_strategy: BackoffStrategy,
    pub rate_limit_floor_secs: f64,
    pub max_retry_after_secs: f64,
    pub history_cap: usize,
    pub history_keep: usize,
    pub adaptive: AdaptiveBackoffConfig,
    /// Per-category replacements for the built-in recovery policies.
    pub policies: BTreeMap<FaultCategory, RecoveryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_strategy: BackoffStrategy::Exponential,
            rate_limit_floor_secs: DEFAULT_RATE_LIMIT_FLOOR_SECS,
            max_retry_after_secs: DEFAULT_MAX_RETRY_AFTER_SECS,
            history_cap: DEFAULT_HISTORY_CAP,
            history_keep: DEFAULT_HISTORY_KEEP,
            adaptive: AdaptiveBackoffConfig::default(),
            policies: BTreeMap::new(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn rate_limit_floor(&self) -> Duration {
        Duration::try_from_secs_f64(self.rate_limit_floor_secs).unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn max_retry_after(&self) -> Duration {
        Duration::try_from_secs_f64(self.max_retry_after_secs).unwrap_or(Duration::ZERO)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("retry.rate_limit_floor_secs", self.rate_limit_floor_secs)?;
        check_non_negative("retry.max_retry_after_secs", self.max_retry_after_secs)?;
        if self.history_cap == 0 {
            return Err(ConfigError::invalid("retry.history_cap", "must be at least 1"));
        }
        if self.history_keep == 0 || self.history_keep > self.history_cap {
            return Err(ConfigError::invalid(
                "retry.history_keep",
                "must be between 1 and history_cap",
            ));
        }
        for (category, policy) in &self.policies {
            if policy.max_delay < policy.initial_delay {
                return Err(ConfigError::invalid(
                    format!("retry.policies.{category}"),
                    "max_delay must not be below initial_delay",
                ));
            }
            if !policy.backoff_multiplier.is_finite() || policy.backoff_multiplier < 1.0 {
                return Err(ConfigError::invalid(
                    format!("retry.policies.{category}.backoff_multiplier"),
                    "must be a finite number >= 1.0",
                ));
            }
        }
        self.adaptive.validate()
    }
}

/// Tuning for [`BackoffStrategy::Adaptive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBackoffConfig {
    /// Records required before adapting; fewer means plain exponential.
    pub min_history: usize,
    /// Number of most recent records considered.
    pub window: usize,
    pub high_success_rate: f64,
    pub medium_success_rate: f64,
    pub high_success_factor: f64,
    pub medium_success_factor: f64,
    pub low_success_factor: f64,
    pub slow_response_secs: f64,
    pub slow_response_factor: f64,
}

impl Default for AdaptiveBackoffConfig {
    fn default() -> Self {
        Self {
            min_history: 3,
            window: 10,
            high_success_rate: 0.8,
            medium_success_rate: 0.5,
            high_success_factor: 0.7,
            medium_success_factor: 1.0,
            low_success_factor: 1.5,
            slow_response_secs: 5.0,
            slow_response_factor: 1.2,
        }
    }
}

impl AdaptiveBackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window == 0 {
            return Err(ConfigError::invalid("retry.adaptive.window", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.medium_success_rate)
            || !(0.0..=1.0).contains(&self.high_success_rate)
            || self.medium_success_rate > self.high_success_rate
        {
            return Err(ConfigError::invalid(
                "retry.adaptive",
                "success rate cutoffs must satisfy 0 <= medium <= high <= 1",
            ));
        }
        for (field, value) in [
            ("retry.adaptive.high_success_factor", self.high_success_factor),
            ("retry.adaptive.medium_success_factor", self.medium_success_factor),
            ("retry.adaptive.low_success_factor", self.low_success_factor),
            ("retry.adaptive.slow_response_secs", self.slow_response_secs),
            ("retry.adaptive.slow_response_factor", self.slow_response_factor),
        ] {
            check_non_negative(field, value)?;
        }
        Ok(())
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be a finite, non-negative number"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert_eq!(RetryConfig::default().rate_limit_floor(), Duration::from_secs(5));
    }

    #[test]
    fn test_keep_above_cap_rejected() {
        let config = RetryConfig {
            history_cap: 10,
            history_keep: 20,
            ..RetryConfig::default()
        };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("retry.history_keep"));
    }

    #[test]
    fn test_inverted_policy_rejected() {
        let mut policy = RecoveryPolicy::for_category(FaultCategory::Network);
        policy.max_delay = Duration::from_millis(10);
        let mut config = RetryConfig::default();
        config.policies.insert(FaultCategory::Network, policy);
        assert!(config.validate().is_err());
    }
}
