//! CivitAI Downloader Core Library
//!
//! Reliability and throughput control plane for bulk model downloads:
//! decides whether and how long to wait before retrying, how many transfers
//! run at once, and how aggressive concurrency and chunking should be.
//!
//! # Architecture
//!
//! - [`fault`] - Fault classification, recovery policies and operation context
//! - [`retry`] - Backoff strategies and the retry orchestrator
//! - [`metrics`] - Per-operation success, timing and error-pattern aggregation
//! - [`optimizer`] - Adaptive connection and chunk-size tuning
//! - [`bulk`] - Batch orchestration of many-file jobs
//! - [`transfer`] - Download collaborator contract and the HTTP implementation
//! - [`scan`] - Post-download security scan collaborator
//! - [`analytics`] - Optional SQLite-backed analytics sink
//! - [`config`] - TOML configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analytics;
pub mod bulk;
pub mod config;
pub mod fault;
pub mod metrics;
pub mod optimizer;
pub mod retry;
pub mod scan;
pub mod transfer;

// Re-export commonly used types
pub use analytics::{AnalyticsSink, SqliteAnalytics};
pub use bulk::{BatchConfig, BulkDownloadManager, BulkJob, BulkStatus, JobOptions, ModelSearchResult};
pub use config::{Config, ConfigError};
pub use fault::{ClassifiedFault, Fault, FaultCategory, FaultClassifier, OperationContext, RecoveryPolicy};
pub use metrics::{MetricsAggregator, PerformanceReport};
pub use optimizer::{NetworkCondition, OptimizationMode, PerformanceOptimizer};
pub use retry::{BackoffStrategy, ErrorHandler, RetryOptions};
pub use scan::{BasicScanner, ScanVerdict, SecurityScanner};
pub use transfer::{HttpTransfer, TaskHandle, TransferClient, TransferError};
