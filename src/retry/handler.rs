//! Retry orchestration.
//!
//! [`ErrorHandler`] owns the classifier, the backoff calculator and the shared
//! metrics store. One long-lived instance is handed by reference (or `Arc`) to
//! every call site so that attempt history accumulates per operation key.
//!
//! # Decision table
//!
//! | Classified fault | Attempt | Action |
//! |------------------|---------|--------|
//! | abort / user-input strategy | any | return original error |
//! | retry / fallback strategy | `> max_retries` | return original error |
//! | retry / fallback strategy | `<= max_retries` | record, sleep, re-invoke |

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::backoff::{BackoffCalculator, BackoffStrategy};
use super::config::RetryConfig;
use super::history::RetryAttemptRecord;
use super::operation::Operation;
use crate::analytics::AnalyticsSink;
use crate::fault::{Fault, FaultCategory, FaultClassifier, FaultSummary, OperationContext};
use crate::metrics::{MetricsAggregator, MetricsConfig, PerformanceReport};
use crate::optimizer::PerformanceOptimizer;

/// Per-call overrides for [`ErrorHandler::execute_with_options`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    /// Replaces the category's `max_retries` when set.
    pub max_retries: Option<u32>,
    /// Replaces the handler's default strategy when set.
    pub strategy: Option<BackoffStrategy>,
    /// Use the optimizer's network-aware delay for network faults.
    pub network_delay: bool,
}

impl RetryOptions {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_network_delay(mut self) -> Self {
        self.network_delay = true;
        self
    }
}

/// What the loop does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
enum NextStep {
    Raise,
    RetryAfter(Duration),
}

/// Runs operations under classification-driven retry.
pub struct ErrorHandler {
    classifier: Arc<FaultClassifier>,
    backoff: BackoffCalculator,
    metrics: Arc<MetricsAggregator>,
    optimizer: Option<Arc<PerformanceOptimizer>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    default_strategy: BackoffStrategy,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(&RetryConfig::default(), &MetricsConfig::default())
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("default_strategy", &self.default_strategy)
            .field("optimizer", &self.optimizer.is_some())
            .field("analytics", &self.analytics.is_some())
            .finish_non_exhaustive()
    }
}

impl ErrorHandler {
    /// Builds a handler with its own classifier and metrics store.
    #[must_use]
    pub fn new(retry: &RetryConfig, metrics: &MetricsConfig) -> Self {
        let classifier = retry
            .policies
            .iter()
            .fold(FaultClassifier::new(), |classifier, (category, policy)| {
                classifier.with_policy(*category, *policy)
            });

        Self {
            classifier: Arc::new(classifier),
            backoff: BackoffCalculator::new(retry),
            metrics: Arc::new(MetricsAggregator::new(
                metrics.clone(),
                retry.history_cap,
                retry.history_keep,
            )),
            optimizer: None,
            analytics: None,
            default_strategy: retry.default_strategy,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<FaultClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsAggregator>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attaches a live network signal used to scale network-fault delays.
    #[must_use]
    pub fn with_optimizer(mut self, optimizer: Arc<PerformanceOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    #[must_use]
    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    #[must_use]
    pub fn classifier(&self) -> &Arc<FaultClassifier> {
        &self.classifier
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    #[must_use]
    pub fn backoff(&self) -> &BackoffCalculator {
        &self.backoff
    }

    #[must_use]
    pub fn optimizer(&self) -> Option<&Arc<PerformanceOptimizer>> {
        self.optimizer.as_ref()
    }

    /// Snapshot of the aggregated metrics.
    #[must_use]
    pub fn performance_report(&self) -> PerformanceReport {
        self.metrics.report()
    }

    /// Runs `operation` until it succeeds or its fault is no longer retried.
    ///
    /// On final failure the error the operation returned is handed back as is.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error when its category is not retryable or
    /// the retry budget is spent.
    pub async fn execute_with_retry<O>(
        &self,
        operation: O,
        context: &OperationContext,
        max_retries: Option<u32>,
        strategy: Option<BackoffStrategy>,
    ) -> Result<O::Output, O::Error>
    where
        O: Operation,
        O::Error: Fault,
    {
        let options = RetryOptions {
            max_retries,
            strategy,
            network_delay: false,
        };
        self.execute_with_options(operation, context, options).await
    }

    /// [`execute_with_retry`](Self::execute_with_retry) with the full option set.
    ///
    /// # Errors
    ///
    /// Same as [`execute_with_retry`](Self::execute_with_retry).
    #[instrument(skip_all, fields(operation = %context.operation_key()))]
    pub async fn execute_with_options<O>(
        &self,
        mut operation: O,
        context: &OperationContext,
        options: RetryOptions,
    ) -> Result<O::Output, O::Error>
    where
        O: Operation,
        O::Error: Fault,
    {
        let key = context.operation_key();
        let strategy = options.strategy.unwrap_or(self.default_strategy);
        let mut attempt: u32 = 1;

        loop {
            let started = Instant::now();
            let outcome = operation.invoke().await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(value) => {
                    self.metrics
                        .record_attempt(&key, RetryAttemptRecord::success(attempt, elapsed, strategy));
                    self.metrics.record_success(&key, elapsed);
                    if attempt > 1 {
                        info!(operation = %key, attempt, "operation succeeded after retry");
                    } else {
                        debug!(operation = %key, elapsed_ms = elapsed.as_millis(), "operation succeeded");
                    }
                    self.report_success(context, elapsed).await;
                    return Ok(value);
                }
                Err(error) => {
                    let (step, summary) = self.plan_next_step(&error, context, &key, attempt, elapsed, strategy, options);
                    if let Some(summary) = summary {
                        self.report_fault(context, &summary).await;
                    }
                    match step {
                        NextStep::Raise => return Err(error),
                        NextStep::RetryAfter(delay) => {
                            tokio::time::sleep(delay).await;
                            attempt = attempt.saturating_add(1);
                        }
                    }
                }
            }
        }
    }

    /// Classifies a failed attempt and decides whether to retry.
    ///
    /// Synchronous so the borrowed [`ClassifiedFault`](crate::fault::ClassifiedFault)
    /// never lives across an await point.
    #[allow(clippy::too_many_arguments)]
    fn plan_next_step(
        &self,
        error: &dyn Fault,
        context: &OperationContext,
        key: &str,
        attempt: u32,
        elapsed: Duration,
        strategy: BackoffStrategy,
        options: RetryOptions,
    ) -> (NextStep, Option<FaultSummary>) {
        let classified = self.classifier.wrap(error, context);
        self.metrics.record_fault(key, &classified);
        let summary = context.request_id().map(|_| classified.summary());

        let max_retries = options.max_retries.unwrap_or(classified.policy().max_retries);

        if !classified.is_retryable() {
            debug!(
                operation = %key,
                category = %classified.category(),
                strategy = ?classified.policy().strategy,
                "fault is not retryable"
            );
            return (NextStep::Raise, summary);
        }

        if attempt > max_retries {
            warn!(
                operation = %key,
                attempt,
                max_retries,
                category = %classified.category(),
                "retries exhausted: {}",
                classified.log_message()
            );
            return (NextStep::Raise, summary);
        }

        let delay = match &self.optimizer {
            Some(optimizer) if options.network_delay && classified.category() == FaultCategory::Network => {
                optimizer.retry_delay(attempt).min(classified.policy().max_delay)
            }
            optimizer => {
                let window = self.backoff.adaptive_config().window;
                let history = self.metrics.history().recent(key, window);
                self.backoff.delay(
                    &classified,
                    attempt,
                    strategy,
                    &history,
                    optimizer.as_ref().map(|o| o.network_condition()),
                )
            }
        };

        self.metrics.record_attempt(
            key,
            RetryAttemptRecord::failure(attempt, delay, classified.fault_name(), elapsed, strategy),
        );

        warn!(
            operation = %key,
            attempt,
            max_retries,
            delay_ms = delay.as_millis(),
            category = %classified.category(),
            "{}; retrying",
            classified.user_message()
        );

        (NextStep::RetryAfter(delay), summary)
    }

    async fn report_success(&self, context: &OperationContext, elapsed: Duration) {
        let (Some(analytics), Some(request_id)) = (&self.analytics, context.request_id()) else {
            return;
        };
        if let Err(error) = analytics.record_api_response(request_id, Some(200), elapsed, None).await {
            debug!(%error, request_id, "analytics sink rejected response record");
        }
    }

    async fn report_fault(&self, context: &OperationContext, summary: &FaultSummary) {
        let (Some(analytics), Some(request_id)) = (&self.analytics, context.request_id()) else {
            return;
        };
        if let Err(error) = analytics.record_api_error(request_id, summary).await {
            debug!(%error, request_id, "analytics sink rejected error record");
        }
    }
}
