//! Retry orchestration with pluggable backoff.
//!
//! [`ErrorHandler::execute_with_retry`] re-invokes an [`Operation`] while its
//! classified fault allows it, waiting the delay chosen by
//! [`BackoffCalculator`] between attempts. Every attempt lands in the shared
//! [`AttemptHistory`] under the context's operation key.

mod backoff;
mod config;
mod handler;
mod history;
mod operation;

pub use backoff::{BackoffCalculator, BackoffInput, BackoffStrategy};
pub use config::{AdaptiveBackoffConfig, DEFAULT_MAX_RETRY_AFTER_SECS, DEFAULT_RATE_LIMIT_FLOOR_SECS, RetryConfig};
pub use handler::{ErrorHandler, RetryOptions};
pub use history::{AttemptHistory, DEFAULT_HISTORY_CAP, DEFAULT_HISTORY_KEEP, RetryAttemptRecord, SUCCESS_OUTCOME};
pub use operation::{Operation, blocking};
