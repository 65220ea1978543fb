//! Fault classification and recovery policies.
//!
//! This module turns raised errors into stable [`FaultCategory`] values and
//! attaches the [`RecoveryPolicy`] the retry machinery should follow.
//!
//! # Overview
//!
//! - [`Fault`] - trait implemented by every error that takes part in retries
//! - [`FaultClassifier`] - ordered rule table, first match wins
//! - [`ClassifiedFault`] - a borrowed fault plus category, policy and messages
//! - [`OperationContext`] - what was running when the fault was raised
//!
//! # Example
//!
//! ```
//! use civitai_core::fault::{CivitaiApiError, FaultCategory, FaultClassifier, OperationContext};
//!
//! let classifier = FaultClassifier::new();
//! let context = OperationContext::new("search_models", "api_client");
//! let error = CivitaiApiError::from_status(429, "slow down", None);
//!
//! let classified = classifier.wrap(&error, &context);
//! assert_eq!(classified.category(), FaultCategory::RateLimit);
//! assert!(classified.is_retryable());
//! ```

mod api;
mod category;
mod classified;
mod classifier;
mod context;
mod kind;

pub use api::CivitaiApiError;
pub(crate) use category::duration_secs;
pub use category::{FaultCategory, RecoveryPolicy, RecoveryStrategy};
pub use classified::{ClassifiedFault, FaultSummary};
pub use classifier::{CallbackError, ClassificationRule, FaultCallback, FaultClassifier, FaultPredicate};
pub use context::{ContextSnapshot, OperationContext};
pub use kind::{Fault, FaultKind, kind_for_status};
