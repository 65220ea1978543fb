//! Fault categories and their default recovery policies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stable classification bucket a raised fault maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    Network,
    Api,
    RateLimit,
    Authentication,
    Authorization,
    NotFound,
    Validation,
    System,
    Unknown,
}

impl FaultCategory {
    /// All categories, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Network,
        Self::Api,
        Self::RateLimit,
        Self::Authentication,
        Self::Authorization,
        Self::NotFound,
        Self::Validation,
        Self::System,
        Self::Unknown,
    ];

    /// Returns the stable lowercase label used in logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Api => "api",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }

    /// Short, non-technical sentence shown to end users.
    #[must_use]
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Network => "Network connection problem. Please check your internet connection.",
            Self::Api => "The CivitAI service returned an error. Please try again later.",
            Self::RateLimit => "Too many requests. Please wait a moment.",
            Self::Authentication => "Authentication failed. Please check your API key.",
            Self::Authorization => "You don't have permission to access this resource.",
            Self::NotFound => "The requested resource was not found.",
            Self::Validation => "Invalid input. Please check your parameters.",
            Self::System => "A system error occurred. Please check disk space and permissions.",
            Self::Unknown => "An unexpected error occurred.",
        }
    }

    /// One-line remediation hint surfaced in reports.
    #[must_use]
    pub fn suggested_action(self) -> &'static str {
        match self {
            Self::Network => "Check connectivity or VPN settings, then retry.",
            Self::Api => "Wait a few minutes and retry; the service may be degraded.",
            Self::RateLimit => "Reduce concurrency or wait before issuing more requests.",
            Self::Authentication => "Set a valid CivitAI API token and retry.",
            Self::Authorization => "Verify your account has access to this model.",
            Self::NotFound => "Verify the model or version ID still exists.",
            Self::Validation => "Review the request parameters and try again.",
            Self::System => "Free disk space or fix file permissions, then retry.",
            Self::Unknown => "Inspect the logs for details and report the issue if it persists.",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a category of fault should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Retry the same operation after a backoff delay.
    Retry,
    /// Retry, but callers may switch to an alternative path.
    Fallback,
    /// Give up immediately.
    Abort,
    /// Give up and ask the user to fix something (credentials, input).
    UserInput,
}

impl RecoveryStrategy {
    /// Whether faults with this strategy are eligible for automatic retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retry | Self::Fallback)
    }
}

/// Strategy plus backoff parameters attached to a [`FaultCategory`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    pub strategy: RecoveryStrategy,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// When false, the jittered backoff strategy degrades to plain exponential.
    pub jitter: bool,
}

impl RecoveryPolicy {
    const fn retrying(
        strategy: RecoveryStrategy,
        max_retries: u32,
        initial_secs: u64,
        max_secs: u64,
    ) -> Self {
        Self {
            strategy,
            max_retries,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_secs(initial_secs),
            max_delay: Duration::from_secs(max_secs),
            jitter: true,
        }
    }

    const fn terminal(strategy: RecoveryStrategy) -> Self {
        Self {
            strategy,
            max_retries: 0,
            backoff_multiplier: 1.0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Returns the built-in policy for a category.
    ///
    /// | Category | Strategy | Retries | Initial | Max |
    /// |----------|----------|---------|---------|-----|
    /// | network | retry | 3 | 1s | 30s |
    /// | api | retry | 2 | 1s | 10s |
    /// | rate_limit | retry | 5 | 5s | 300s |
    /// | authentication | user_input | 0 | - | - |
    /// | authorization | abort | 0 | - | - |
    /// | not_found | abort | 0 | - | - |
    /// | validation | abort | 0 | - | - |
    /// | system | fallback | 1 | 2s | 10s |
    /// | unknown | retry | 1 | 1s | 10s |
    #[must_use]
    pub const fn for_category(category: FaultCategory) -> Self {
        match category {
            FaultCategory::Network => Self::retrying(RecoveryStrategy::Retry, 3, 1, 30),
            FaultCategory::Api => Self::retrying(RecoveryStrategy::Retry, 2, 1, 10),
            FaultCategory::RateLimit => Self::retrying(RecoveryStrategy::Retry, 5, 5, 300),
            FaultCategory::Authentication => Self::terminal(RecoveryStrategy::UserInput),
            FaultCategory::Authorization | FaultCategory::NotFound | FaultCategory::Validation => {
                Self::terminal(RecoveryStrategy::Abort)
            }
            FaultCategory::System => Self::retrying(RecoveryStrategy::Fallback, 1, 2, 10),
            FaultCategory::Unknown => Self::retrying(RecoveryStrategy::Retry, 1, 1, 10),
        }
    }

    /// Whether this policy allows automatic retry at all.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.strategy.is_retryable()
    }
}

/// Serializes a [`Duration`] as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_strategies() {
        assert!(RecoveryStrategy::Retry.is_retryable());
        assert!(RecoveryStrategy::Fallback.is_retryable());
        assert!(!RecoveryStrategy::Abort.is_retryable());
        assert!(!RecoveryStrategy::UserInput.is_retryable());
    }

    #[test]
    fn test_credentials_and_input_never_retry() {
        let auth = RecoveryPolicy::for_category(FaultCategory::Authentication);
        assert_eq!(auth.strategy, RecoveryStrategy::UserInput);
        assert!(!auth.is_retryable());

        let validation = RecoveryPolicy::for_category(FaultCategory::Validation);
        assert_eq!(validation.strategy, RecoveryStrategy::Abort);
        assert_eq!(validation.max_retries, 0);
    }

    #[test]
    fn test_rate_limit_has_most_generous_budget() {
        let rate_limit = RecoveryPolicy::for_category(FaultCategory::RateLimit);
        for category in FaultCategory::ALL {
            let policy = RecoveryPolicy::for_category(category);
            assert!(rate_limit.max_retries >= policy.max_retries);
            assert!(rate_limit.initial_delay >= policy.initial_delay);
        }
    }

    #[test]
    fn test_category_labels_are_unique() {
        let mut labels: Vec<_> = FaultCategory::ALL.iter().map(|c| c.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), FaultCategory::ALL.len());
    }

    #[test]
    fn test_rate_limit_user_message() {
        assert_eq!(
            FaultCategory::RateLimit.user_message(),
            "Too many requests. Please wait a moment."
        );
    }
}
