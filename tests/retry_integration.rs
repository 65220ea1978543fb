//! Integration tests for the retry orchestrator.
//!
//! Time-dependent tests run on a paused tokio clock so backoff sleeps
//! complete instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use civitai_core::analytics::SqliteAnalytics;
use civitai_core::fault::{CivitaiApiError, Fault, FaultCategory, FaultKind, OperationContext, RecoveryPolicy, RecoveryStrategy};
use civitai_core::metrics::MetricsConfig;
use civitai_core::retry::{BackoffStrategy, ErrorHandler, RetryConfig, blocking};

#[derive(Debug, thiserror::Error)]
#[error("flaky operation failed with {0:?}")]
struct Flaky(FaultKind);

impl Fault for Flaky {
    fn kind(&self) -> FaultKind {
        self.0
    }
}

fn context(operation: &str) -> OperationContext {
    OperationContext::new(operation, "svc")
}

#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds_records_three_attempts() {
    let handler = ErrorHandler::default();
    let calls = AtomicU32::new(0);

    let result = handler
        .execute_with_retry(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if call < 3 {
                        Err(Flaky(FaultKind::Connection))
                    } else {
                        Ok(call)
                    }
                }
            },
            &context("fetch"),
            Some(5),
            Some(BackoffStrategy::Exponential),
        )
        .await;

    assert_eq!(result.expect("third attempt succeeds"), 3);

    let records = handler.metrics().history().records("svc.fetch");
    let attempts: Vec<u32> = records.iter().map(|r| r.attempt_number).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(records.iter().filter(|r| !r.success).count(), 2);
    assert_eq!(records.iter().filter(|r| r.success).count(), 1);
    assert_eq!(records[0].outcome, "Flaky");
    assert!(records[1].delay >= records[0].delay);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_returns_original_error_after_budget() {
    let handler = ErrorHandler::default();
    let calls = AtomicU32::new(0);

    let result: Result<(), Flaky> = handler
        .execute_with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky(FaultKind::Timeout)) }
            },
            &context("always_fails"),
            Some(3),
            None,
        )
        .await;

    let error = result.expect_err("budget is exhausted");
    assert_eq!(error.0, FaultKind::Timeout);

    let records = handler.metrics().history().records("svc.always_fails");
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| !r.success));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_categories_raise_on_first_attempt() {
    let handler = ErrorHandler::default();

    for kind in [
        FaultKind::Unauthenticated,
        FaultKind::Forbidden,
        FaultKind::NotFound,
        FaultKind::InvalidValue,
        FaultKind::PermissionDenied,
    ] {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), Flaky> = handler
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Flaky(kind)) }
                },
                &context("abort"),
                Some(10),
                None,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "{kind:?} should not be retried");
        assert_eq!(started.elapsed(), Duration::ZERO, "{kind:?} should not wait");
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_at_least_five_seconds() {
    let handler = ErrorHandler::default();

    for strategy in [
        BackoffStrategy::Exponential,
        BackoffStrategy::Linear,
        BackoffStrategy::Fibonacci,
        BackoffStrategy::Jittered,
        BackoffStrategy::Adaptive,
    ] {
        let key = format!("rate_{}", strategy.as_str());
        let calls = AtomicU32::new(0);
        let _: Result<(), CivitaiApiError> = handler
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CivitaiApiError::from_status(429, "slow down", None)) }
                },
                &context(&key),
                Some(2),
                Some(strategy),
            )
            .await;

        let records = handler.metrics().history().records(&format!("svc.{key}"));
        assert_eq!(records.len(), 2);
        for record in records {
            assert!(
                record.delay >= Duration::from_secs(5),
                "{strategy:?} attempt {} waited {:?}",
                record.attempt_number,
                record.delay
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_blocking_operation_is_retried() {
    let handler = ErrorHandler::default();
    let mut remaining_failures = 1;

    let value = handler
        .execute_with_retry(
            blocking(|| {
                if remaining_failures > 0 {
                    remaining_failures -= 1;
                    Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
                } else {
                    Ok("done")
                }
            }),
            &context("sync_call"),
            None,
            None,
        )
        .await
        .expect("second attempt succeeds");

    assert_eq!(value, "done");
    assert_eq!(handler.metrics().history().len("svc.sync_call"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_performance_report_after_mixed_outcomes() {
    let handler = ErrorHandler::default();
    let calls = AtomicU32::new(0);

    handler
        .execute_with_retry(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(CivitaiApiError::from_status(503, "busy", None))
                    } else {
                        Ok(())
                    }
                }
            },
            &context("search"),
            None,
            None,
        )
        .await
        .expect("retry succeeds");

    let report = handler.performance_report();
    assert_eq!(report.error_patterns.get("search.ApiError"), Some(&1));
    let effectiveness = &report.retry_effectiveness["svc.search"];
    assert_eq!(effectiveness.total_retries, 1);
    assert_eq!(effectiveness.successful_retries, 1);
    assert_eq!(
        report.performance_impact["svc.search"].faults_by_category.get(FaultCategory::Api.as_str()),
        Some(&1)
    );
}

#[tokio::test]
async fn test_analytics_receives_responses_and_errors() {
    let mut retry = RetryConfig::default();
    retry.policies.insert(
        FaultCategory::Network,
        RecoveryPolicy {
            strategy: RecoveryStrategy::Retry,
            max_retries: 2,
            backoff_multiplier: 1.0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            jitter: false,
        },
    );
    let analytics = Arc::new(SqliteAnalytics::new_in_memory().await.expect("in-memory analytics"));
    let handler = ErrorHandler::new(&retry, &MetricsConfig::default()).with_analytics(analytics.clone());
    let calls = AtomicU32::new(0);

    handler
        .execute_with_retry(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(Flaky(FaultKind::Connection))
                    } else {
                        Ok(())
                    }
                }
            },
            &context("tracked").with_request_id("req-42"),
            None,
            None,
        )
        .await
        .expect("retry succeeds");

    assert_eq!(analytics.error_count("req-42").await.expect("count errors"), 1);
    assert_eq!(analytics.response_count("req-42").await.expect("count responses"), 1);
}
